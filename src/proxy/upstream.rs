//! Backend health tracking and round-robin selection.
//!
//! Health records are written by two sources: active `/ping` probes and
//! passive observation of forwarding outcomes. Concurrent writers
//! interleave arbitrarily and the last writer wins; health is advisory,
//! so no versioning is needed. Records for removed backends are not
//! purged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Timeout for active `/ping` probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Last-known health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Health record for one backend, keyed by backend name.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    /// Unix seconds of the last probe or forwarding outcome.
    #[serde(rename = "lastCheck")]
    pub last_check: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: 0,
            error: None,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Tracks per-backend health status.
///
/// Thread-safe via DashMap. Backends never seen are `Unknown`, which is
/// not healthy: routing treats only an explicit `Healthy` as usable and
/// falls back to the unfiltered candidate set when nothing qualifies.
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Records a probe or forwarding outcome for a backend.
    pub fn set_status(&self, name: &str, status: HealthStatus, error: Option<String>) {
        self.records.insert(
            name.to_string(),
            HealthRecord {
                status,
                last_check: unix_now(),
                error,
            },
        );
    }

    /// Returns the record for a backend, `Unknown` if never seen.
    pub fn status(&self, name: &str) -> HealthRecord {
        self.records
            .get(name)
            .map(|r| r.clone())
            .unwrap_or_else(HealthRecord::unknown)
    }

    /// Returns whether a backend is explicitly healthy.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.records
            .get(name)
            .map(|r| r.status == HealthStatus::Healthy)
            .unwrap_or(false)
    }

    /// Returns all records, sorted by backend name for stable output.
    pub fn all(&self) -> BTreeMap<String, HealthRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-type round-robin cursors.
///
/// One atomic counter per type key; selection takes the counter modulo
/// the current pool length, so a pool that grows or shrinks between calls
/// rebases naturally. This can skip or repeat a backend while the healthy
/// set is changing — weak fairness, not strict round-robin.
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Returns the next index into a pool of `pool_len` candidates for
    /// type `ty`, advancing the cursor. `pool_len` must be non-zero.
    pub fn next(&self, ty: &str, pool_len: usize) -> usize {
        let cursor = self
            .cursors
            .entry(ty.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % pool_len
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// Probes a backend's `/ping` endpoint.
///
/// Healthy iff the backend answers 200 with a body of exactly `pong`;
/// anything else (including transport errors) is unhealthy with the
/// cause captured.
pub async fn check_health(client: &reqwest::Client, url: &str) -> Result<(), String> {
    let response = client
        .get(format!("{url}/ping"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status == reqwest::StatusCode::OK {
        let body = response.text().await.map_err(|e| e.to_string())?;
        if body == "pong" {
            return Ok(());
        }
    }
    Err(format!("unexpected response: {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // ========== HealthTracker ==========

    #[test]
    fn test_unseen_backend_is_unknown() {
        let tracker = HealthTracker::new();
        let record = tracker.status("a");
        assert_eq!(record.status, HealthStatus::Unknown);
        assert_eq!(record.last_check, 0);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_unknown_is_not_healthy() {
        let tracker = HealthTracker::new();
        assert!(!tracker.is_healthy("a"));
    }

    #[test]
    fn test_set_status_healthy() {
        let tracker = HealthTracker::new();
        tracker.set_status("a", HealthStatus::Healthy, None);
        assert!(tracker.is_healthy("a"));
        assert!(tracker.status("a").last_check > 0);
    }

    #[test]
    fn test_set_status_unhealthy_captures_error() {
        let tracker = HealthTracker::new();
        tracker.set_status("a", HealthStatus::Unhealthy, Some("connection refused".into()));
        let record = tracker.status("a");
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_last_writer_wins() {
        let tracker = HealthTracker::new();
        tracker.set_status("a", HealthStatus::Unhealthy, Some("boom".into()));
        tracker.set_status("a", HealthStatus::Healthy, None);
        let record = tracker.status("a");
        assert_eq!(record.status, HealthStatus::Healthy);
        assert!(record.error.is_none());
    }

    #[test]
    fn test_all_is_sorted_by_name() {
        let tracker = HealthTracker::new();
        tracker.set_status("b", HealthStatus::Healthy, None);
        tracker.set_status("a", HealthStatus::Unhealthy, None);
        let all = tracker.all();
        let names: Vec<&String> = all.keys().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_record_serializes_status_and_last_check() {
        let tracker = HealthTracker::new();
        tracker.set_status("a", HealthStatus::Healthy, None);
        let json = serde_json::to_value(tracker.status("a")).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["lastCheck"].as_u64().unwrap() > 0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_concurrent_status_updates() {
        use std::thread;

        let tracker = Arc::new(HealthTracker::new());
        let mut handles = vec![];
        for i in 0..10 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        tracker.set_status("a", HealthStatus::Healthy, None);
                    } else {
                        tracker.set_status("a", HealthStatus::Unhealthy, Some("err".into()));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // One of the two writes won; either way the record is consistent.
        let record = tracker.status("a");
        assert!(matches!(
            record.status,
            HealthStatus::Healthy | HealthStatus::Unhealthy
        ));
    }

    // ========== RoundRobin ==========

    #[test]
    fn test_round_robin_cycles_through_pool() {
        let rr = RoundRobin::new();
        let picks: Vec<usize> = (0..6).map(|_| rr.next("image", 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_single_candidate() {
        let rr = RoundRobin::new();
        for _ in 0..5 {
            assert_eq!(rr.next("image", 1), 0);
        }
    }

    #[test]
    fn test_round_robin_cursors_are_independent_per_type() {
        let rr = RoundRobin::new();
        assert_eq!(rr.next("image", 2), 0);
        assert_eq!(rr.next("image", 2), 1);
        // a fresh type starts from its own cursor
        assert_eq!(rr.next("textual", 2), 0);
        assert_eq!(rr.next("image", 2), 0);
    }

    #[test]
    fn test_round_robin_rebases_on_pool_shrink() {
        let rr = RoundRobin::new();
        rr.next("image", 3);
        rr.next("image", 3);
        // cursor is at 2; a shrunken pool wraps via modulo
        assert_eq!(rr.next("image", 2), 0);
    }

    #[test]
    fn test_round_robin_concurrent_selection_is_balanced() {
        use std::thread;

        let rr = Arc::new(RoundRobin::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let rr = Arc::clone(&rr);
            handles.push(thread::spawn(move || {
                let mut counts = [0usize; 3];
                for _ in 0..300 {
                    counts[rr.next("image", 3)] += 1;
                }
                counts
            }));
        }
        let mut totals = [0usize; 3];
        for handle in handles {
            let counts = handle.join().unwrap();
            for (total, count) in totals.iter_mut().zip(counts) {
                *total += count;
            }
        }
        // 1200 selections across 3 slots: exact balance, whatever the interleaving
        assert_eq!(totals, [400, 400, 400]);
    }

    #[test]
    fn test_tracker_and_round_robin_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HealthTracker>();
        assert_send_sync::<RoundRobin>();
    }

    // ========== check_health ==========

    #[tokio::test]
    async fn test_check_health_pong_is_healthy() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(check_health(&client, &server.uri()).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_health_wrong_body_is_unhealthy() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = check_health(&client, &server.uri()).await.unwrap_err();
        assert!(err.contains("unexpected response"));
    }

    #[tokio::test]
    async fn test_check_health_non_200_is_unhealthy() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(check_health(&client, &server.uri()).await.is_err());
    }

    #[tokio::test]
    async fn test_check_health_transport_failure_is_unhealthy() {
        let client = reqwest::Client::new();
        // nothing listens here
        let err = check_health(&client, "http://127.0.0.1:9")
            .await
            .unwrap_err();
        assert!(!err.is_empty());
    }
}
