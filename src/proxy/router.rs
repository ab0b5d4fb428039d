//! Per-type backend selection.
//!
//! Resolves the candidate pool for each type group (routed backend,
//! healthy-first, default fallback) and picks one backend via the shared
//! round-robin cursors. Availability wins over freshness: when every
//! candidate is unhealthy, selection degrades to the unfiltered pool
//! instead of failing fast.

use std::sync::Arc;

use crate::error::ProxyError;
use crate::store::{Backend, Registry};

use super::upstream::{HealthTracker, RoundRobin};

/// Routes type groups to backends.
///
/// Thread-safe via shared references to the registry and health tracker;
/// the round-robin cursors live here and persist across requests.
pub struct Router {
    registry: Arc<Registry>,
    health: Arc<HealthTracker>,
    round_robin: RoundRobin,
}

impl Router {
    pub fn new(registry: Arc<Registry>, health: Arc<HealthTracker>) -> Self {
        Self {
            registry,
            health,
            round_robin: RoundRobin::new(),
        }
    }

    /// Returns the routed candidates for a type, filtered to healthy ones.
    pub fn healthy_backends_for_type(&self, ty: &str) -> Vec<Backend> {
        self.registry
            .backends_for_type(ty)
            .into_iter()
            .filter(|b| self.health.is_healthy(&b.name))
            .collect()
    }

    /// Picks one backend for a type group.
    ///
    /// Candidate resolution:
    /// 1. no routing entry: the default backend alone, or `NoBackendForType`
    /// 2. routed with healthy candidates: the healthy subset
    /// 3. routed with none healthy: the full routed set
    ///
    /// One round-robin step over the pool decides the winner. Failures here
    /// are per-type; callers must not let them abort sibling groups.
    pub fn choose(&self, ty: &str) -> Result<Backend, ProxyError> {
        let all = self.registry.backends_for_type(ty);

        let pool = if all.is_empty() {
            let default = self
                .registry
                .default_backend()
                .ok_or_else(|| ProxyError::NoBackendForType(ty.to_string()))?;
            vec![default]
        } else {
            let healthy: Vec<Backend> = all
                .iter()
                .filter(|b| self.health.is_healthy(&b.name))
                .cloned()
                .collect();
            if healthy.is_empty() {
                all
            } else {
                healthy
            }
        };

        let index = self.round_robin.next(ty, pool.len());
        let backend = pool[index].clone();
        tracing::debug!(ty, backend = %backend.name, pool = pool.len(), "selected backend");
        Ok(backend)
    }
}
