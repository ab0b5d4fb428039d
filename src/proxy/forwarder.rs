//! Concurrent fan-out of type groups to their backends.
//!
//! Each type group is re-serialized into a fresh multipart request
//! (group entries plus the full shared attachment set) and POSTed to the
//! chosen backend's `/predict`. Groups run as independent tokio tasks
//! joined by a barrier; a failing group never cancels its siblings, and
//! every outcome is reported to the health tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::HeaderMap;
use rand::Rng;
use reqwest::multipart;
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::error::ProxyError;

use super::entries::{entries_for_type, TypeGroup};
use super::router::Router;
use super::upstream::{HealthStatus, HealthTracker};

/// Timeout for a single forwarded `/predict` call.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// Headers never propagated to backends. The multipart rebuild owns the
/// content type and length; the rest are hop-by-hop.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "content-type",
    "connection",
    "transfer-encoding",
];

/// A non-`entries` multipart field from the original request.
///
/// Attachments are addressed by a shared field name (e.g. `image`), not
/// per entry, so every type group receives the full set.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Hooks invoked around every outgoing backend call.
///
/// The diagnostic recorder consumes these; the default is a no-op. The
/// `body` handed to `on_request` is the group's entries payload, not the
/// full multipart encoding.
pub trait ForwardObserver: Send + Sync {
    fn on_request(&self, _id: &str, _method: &str, _url: &str, _headers: &HeaderMap, _body: &[u8]) {
    }
    fn on_response(&self, _id: &str, _status: u16, _headers: &HeaderMap, _body: &[u8]) {}
    fn on_error(&self, _id: &str, _error: &str) {}
}

/// Default observer that records nothing.
pub struct NoopObserver;

impl ForwardObserver for NoopObserver {}

/// Generates a unique id tying an observer's request and response
/// records together.
fn generate_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("{millis:x}-{suffix:06x}")
}

/// Forwards type groups to backends and reports outcomes.
pub struct Forwarder {
    client: reqwest::Client,
    health: Arc<HealthTracker>,
    observer: Arc<dyn ForwardObserver>,
}

impl Forwarder {
    pub fn new(health: Arc<HealthTracker>, observer: Arc<dyn ForwardObserver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            health,
            observer,
        }
    }

    /// Forwards every group concurrently and waits for all of them.
    ///
    /// Returns the per-type results plus the collected failures, each
    /// formatted `type {t}: {message}` and sorted for stable responses.
    /// No fail-fast: a group that errors contributes to the failure list
    /// while its siblings run to completion.
    pub async fn fan_out(
        self: Arc<Self>,
        router: &Arc<Router>,
        groups: Vec<TypeGroup>,
        attachments: Arc<Vec<Attachment>>,
        headers: HeaderMap,
    ) -> (HashMap<String, Map<String, Value>>, Vec<String>) {
        let mut tasks = JoinSet::new();
        for group in groups {
            let forwarder = Arc::clone(&self);
            let router = Arc::clone(router);
            let attachments = Arc::clone(&attachments);
            let headers = headers.clone();
            tasks.spawn(async move {
                let outcome = forwarder
                    .forward_group(&router, &group, &attachments, &headers)
                    .await;
                (group.ty, outcome)
            });
        }

        let mut results = HashMap::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((ty, Ok(result))) => {
                    results.insert(ty, result);
                }
                Ok((ty, Err(err))) => errors.push(format!("type {ty}: {err}")),
                Err(err) => errors.push(format!("forward task failed: {err}")),
            }
        }
        errors.sort();
        (results, errors)
    }

    /// Forwards one type group to its chosen backend.
    async fn forward_group(
        &self,
        router: &Router,
        group: &TypeGroup,
        attachments: &[Attachment],
        headers: &HeaderMap,
    ) -> Result<Map<String, Value>, ProxyError> {
        let backend = router.choose(&group.ty)?;
        let entries_json = entries_for_type(&group.entries).to_string();
        let url = format!("{}/predict", backend.url);
        let id = generate_id();

        self.observer
            .on_request(&id, "POST", &url, headers, entries_json.as_bytes());

        let mut form = multipart::Form::new().text("entries", entries_json);
        for attachment in attachments {
            let mut part = multipart::Part::bytes(attachment.data.to_vec());
            if let Some(file_name) = &attachment.file_name {
                part = part.file_name(file_name.clone());
            }
            if let Some(content_type) = &attachment.content_type {
                part = part.mime_str(content_type).map_err(|e| {
                    ProxyError::MalformedEntries(format!("invalid attachment content type: {e}"))
                })?;
            }
            form = form.part(attachment.field.clone(), part);
        }

        let mut request = self.client.post(&url).timeout(FORWARD_TIMEOUT);
        for (name, value) in headers {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }

        let response = match request.multipart(form).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(&id, &backend.name, e.to_string())),
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Err(self.fail(&id, &backend.name, e.to_string())),
        };
        self.observer
            .on_response(&id, status.as_u16(), &response_headers, &body);

        if status != reqwest::StatusCode::OK {
            let err = ProxyError::BackendError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            };
            self.health
                .set_status(&backend.name, HealthStatus::Unhealthy, Some(err.to_string()));
            tracing::warn!(ty = %group.ty, backend = %backend.name, status = status.as_u16(), "backend rejected forwarded request");
            return Err(err);
        }

        // The HTTP exchange succeeded; the backend counts as healthy even
        // if its body turns out to be malformed.
        self.health.set_status(&backend.name, HealthStatus::Healthy, None);

        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(result)) => Ok(result),
            Ok(_) => Err(ProxyError::InvalidBackendResponse(
                "expected a JSON object".into(),
            )),
            Err(e) => Err(ProxyError::InvalidBackendResponse(e.to_string())),
        }
    }

    /// Records a transport-level failure: health, observer, error value.
    fn fail(&self, id: &str, backend: &str, message: String) -> ProxyError {
        self.health
            .set_status(backend, HealthStatus::Unhealthy, Some(message.clone()));
        self.observer.on_error(id, &message);
        tracing::warn!(backend, error = %message, "backend unreachable");
        ProxyError::BackendUnreachable(message)
    }
}
