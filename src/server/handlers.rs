//! Route handlers.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::error::ProxyError;
use crate::proxy::{check_health, group_by_type, merge_results, parse_entries, Attachment, HealthStatus};

use super::AppState;

/// POST /predict
///
/// Splits the entries by type, fans the groups out to their backends,
/// and merges the results in the caller's declaration order. All or
/// nothing: any failed group turns the whole request into a 500 listing
/// every failure.
pub async fn predict(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut entries_raw: Option<String> = None;
    let mut attachments: Vec<Attachment> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return ProxyError::MalformedEntries(e.to_string()).into_response(),
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == "entries" {
            match field.text().await {
                Ok(text) => entries_raw = Some(text),
                Err(e) => return ProxyError::MalformedEntries(e.to_string()).into_response(),
            }
        } else {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            match field.bytes().await {
                Ok(data) => attachments.push(Attachment {
                    field: name,
                    file_name,
                    content_type,
                    data,
                }),
                Err(e) => return ProxyError::MalformedEntries(e.to_string()).into_response(),
            }
        }
    }

    let Some(raw) = entries_raw else {
        return ProxyError::MalformedEntries("missing entries field".into()).into_response();
    };
    let entries = match parse_entries(&raw) {
        Ok(entries) => entries,
        Err(e) => return e.into_response(),
    };
    if entries.is_empty() {
        return ProxyError::EmptyEntries.into_response();
    }

    let groups = group_by_type(&entries);
    tracing::debug!(entries = entries.len(), groups = groups.len(), "dispatching predict");

    let (results, errors) = state
        .forwarder
        .fan_out(&state.router, groups, Arc::new(attachments), headers)
        .await;

    if !errors.is_empty() {
        tracing::warn!(failed = errors.len(), "predict failed for one or more types");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "failed to process one or more types",
                "errors": errors,
            })),
        )
            .into_response();
    }

    Json(Value::Object(merge_results(&entries, &results))).into_response()
}

/// GET /ping
///
/// Probes every configured backend concurrently, records the outcomes,
/// and answers `pong` only when the default backend is healthy and every
/// routed type has a healthy candidate.
pub async fn ping(State(state): State<AppState>) -> Response {
    let backends = state.registry.backends();
    if backends.is_empty() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let mut probes = JoinSet::new();
    for backend in backends {
        let client = state.probe_client.clone();
        probes.spawn(async move {
            let outcome = check_health(&client, &backend.url).await;
            (backend.name, outcome)
        });
    }
    while let Some(joined) = probes.join_next().await {
        if let Ok((name, outcome)) = joined {
            match outcome {
                Ok(()) => state.health.set_status(&name, HealthStatus::Healthy, None),
                Err(e) => state.health.set_status(&name, HealthStatus::Unhealthy, Some(e)),
            }
        }
    }

    let default_healthy = state
        .registry
        .default_backend()
        .map(|b| state.health.is_healthy(&b.name))
        .unwrap_or(false);
    let routed_healthy = state
        .registry
        .routed_types()
        .iter()
        .all(|ty| !state.router.healthy_backends_for_type(ty).is_empty());

    if default_healthy && routed_healthy {
        (StatusCode::OK, "pong").into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Response {
    Json(state.health.all()).into_response()
}

/// GET /api/config
pub async fn config_get(State(state): State<AppState>) -> Response {
    Json(state.registry.snapshot()).into_response()
}

/// POST /api/config
pub async fn config_set(
    State(state): State<AppState>,
    Json(config): Json<crate::store::ProxyConfig>,
) -> Response {
    match state.registry.set_config(config) {
        Ok(()) => {
            tracing::info!("configuration replaced");
            Json(json!({"message": "configuration saved"})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /api/debug/status
pub async fn debug_status(State(state): State<AppState>) -> Response {
    Json(state.recorder.status()).into_response()
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    enabled: bool,
}

/// POST /api/debug/toggle
pub async fn debug_toggle(
    State(state): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> Response {
    state.recorder.set_enabled(req.enabled);
    Json(json!({"enabled": req.enabled})).into_response()
}

#[derive(Deserialize)]
pub struct MaxRecordsRequest {
    #[serde(rename = "maxRecords")]
    max_records: usize,
}

/// POST /api/debug/max-records
pub async fn debug_max_records(
    State(state): State<AppState>,
    Json(req): Json<MaxRecordsRequest>,
) -> Response {
    if !(1..=10_000).contains(&req.max_records) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "maxRecords must be between 1 and 10000"})),
        )
            .into_response();
    }
    state.recorder.set_max_records(req.max_records);
    Json(json!({"maxRecords": req.max_records})).into_response()
}

/// GET /api/debug/records
pub async fn debug_records(State(state): State<AppState>) -> Response {
    Json(state.recorder.records()).into_response()
}

/// DELETE /api/debug/records
pub async fn debug_clear(State(state): State<AppState>) -> Response {
    state.recorder.clear();
    Json(json!({"message": "records cleared"})).into_response()
}
