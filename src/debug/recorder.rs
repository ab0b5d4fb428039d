//! In-memory ring buffer of forwarded exchanges.
//!
//! Disabled by default; when enabled it captures every outgoing backend
//! call and its response (or transport error) up to a configurable cap,
//! evicting the oldest records first. Bodies are stored as lossy UTF-8
//! since captures are for human inspection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use serde::Serialize;

use crate::proxy::ForwardObserver;

const DEFAULT_MAX_RECORDS: usize = 100;

/// The request half of a captured exchange.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// The response half, absent when the call failed in transport.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// One captured exchange, matched to its response by id.
#[derive(Debug, Clone, Serialize)]
pub struct HttpRecord {
    pub id: String,
    /// Unix milliseconds at capture time.
    pub timestamp: u128,
    pub request: RecordedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordedResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of the recorder's settings and fill level.
#[derive(Debug, Clone, Serialize)]
pub struct DebugStatus {
    pub enabled: bool,
    #[serde(rename = "maxRecords")]
    pub max_records: usize,
    #[serde(rename = "recordCount")]
    pub record_count: usize,
}

struct RecorderState {
    enabled: bool,
    max_records: usize,
    records: VecDeque<HttpRecord>,
}

/// Thread-safe capture ring, wired into the forwarder as its observer.
pub struct DebugRecorder {
    state: RwLock<RecorderState>,
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

impl DebugRecorder {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RecorderState {
                enabled: false,
                max_records: DEFAULT_MAX_RECORDS,
                records: VecDeque::new(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RecorderState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RecorderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> DebugStatus {
        let state = self.read();
        DebugStatus {
            enabled: state.enabled,
            max_records: state.max_records,
            record_count: state.records.len(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.write().enabled = enabled;
    }

    /// Sets the record cap, trimming the oldest records if over it.
    pub fn set_max_records(&self, max_records: usize) {
        let mut state = self.write();
        state.max_records = max_records;
        while state.records.len() > max_records {
            state.records.pop_front();
        }
    }

    /// Returns captured records, oldest first.
    pub fn records(&self) -> Vec<HttpRecord> {
        self.read().records.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.write().records.clear();
    }

    /// Finds the most recent record with the given id. Searching from the
    /// back matches responses to requests even when ids ever collided.
    fn with_record<F: FnOnce(&mut HttpRecord)>(&self, id: &str, apply: F) {
        let mut state = self.write();
        if !state.enabled {
            return;
        }
        if let Some(record) = state.records.iter_mut().rev().find(|r| r.id == id) {
            apply(record);
        }
    }
}

impl Default for DebugRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardObserver for DebugRecorder {
    fn on_request(&self, id: &str, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
        let mut state = self.write();
        if !state.enabled {
            return;
        }
        if state.max_records == 0 {
            return;
        }
        while state.records.len() >= state.max_records {
            state.records.pop_front();
        }
        state.records.push_back(HttpRecord {
            id: id.to_string(),
            timestamp: unix_millis(),
            request: RecordedRequest {
                method: method.to_string(),
                url: url.to_string(),
                headers: flatten_headers(headers),
                body: String::from_utf8_lossy(body).into_owned(),
            },
            response: None,
            error: None,
        });
    }

    fn on_response(&self, id: &str, status: u16, headers: &HeaderMap, body: &[u8]) {
        let response = RecordedResponse {
            status_code: status,
            headers: flatten_headers(headers),
            body: String::from_utf8_lossy(body).into_owned(),
        };
        self.with_record(id, |record| record.response = Some(response));
    }

    fn on_error(&self, id: &str, error: &str) {
        let error = error.to_string();
        self.with_record(id, |record| record.error = Some(error));
    }
}
