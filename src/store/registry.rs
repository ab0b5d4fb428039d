//! Thread-safe backend registry with file persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// A named downstream inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub url: String,
}

/// The persisted proxy configuration.
///
/// `task_routing` maps a type name to a backend name; types absent from
/// the table resolve to `default_backend`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub default_backend: String,
    pub backends: Vec<Backend>,
    pub task_routing: BTreeMap<String, String>,
}

/// Holds the backend set, default backend, and type routing table.
///
/// All reads take a shared lock; the only writer is a full config replace.
/// Lookups tolerate dangling routing references (a routing entry naming a
/// removed backend behaves as "no match") — referential integrity is
/// enforced only at config-save time.
pub struct Registry {
    state: RwLock<ProxyConfig>,
    path: Option<PathBuf>,
}

impl Registry {
    /// Creates a registry with no persistence, seeded with `config`.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: RwLock::new(config),
            path: None,
        }
    }

    /// Creates a registry backed by a JSON file.
    ///
    /// A missing or unreadable file yields the default empty configuration;
    /// the service starts either way and waits for a config save.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config file");
                    ProxyConfig::default()
                }
            },
            Err(_) => ProxyConfig::default(),
        };
        Self {
            state: RwLock::new(config),
            path: Some(path),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ProxyConfig> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProxyConfig> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the current configuration.
    pub fn snapshot(&self) -> ProxyConfig {
        self.read().clone()
    }

    /// Returns all configured backends.
    pub fn backends(&self) -> Vec<Backend> {
        self.read().backends.clone()
    }

    /// Returns the default backend, or `None` if unset or dangling.
    pub fn default_backend(&self) -> Option<Backend> {
        let state = self.read();
        if state.default_backend.is_empty() {
            return None;
        }
        state
            .backends
            .iter()
            .find(|b| b.name == state.default_backend)
            .cloned()
    }

    /// Resolves the backend URL for a type.
    ///
    /// Routing-table entry first, then the default backend, else `None`.
    pub fn backend_url(&self, ty: &str) -> Option<String> {
        let state = self.read();
        if let Some(name) = state.task_routing.get(ty) {
            if let Some(backend) = state.backends.iter().find(|b| &b.name == name) {
                return Some(backend.url.clone());
            }
        }
        drop(state);
        self.default_backend().map(|b| b.url)
    }

    /// Returns the routed backend for a type as a (zero- or one-element)
    /// candidate list.
    ///
    /// Types without a routing entry get an empty list; callers apply the
    /// default-backend fallback themselves. Type routing is deliberately
    /// single-backend-per-type.
    pub fn backends_for_type(&self, ty: &str) -> Vec<Backend> {
        let state = self.read();
        let Some(name) = state.task_routing.get(ty) else {
            return Vec::new();
        };
        state
            .backends
            .iter()
            .filter(|b| &b.name == name)
            .cloned()
            .collect()
    }

    /// Returns every type name present in the routing table.
    pub fn routed_types(&self) -> Vec<String> {
        self.read().task_routing.keys().cloned().collect()
    }

    /// Atomically replaces the whole configuration.
    ///
    /// Validates the new config, persists it, and only then commits it in
    /// memory — a failed write leaves the previous config in effect.
    pub fn set_config(&self, config: ProxyConfig) -> Result<(), ProxyError> {
        validate(&config)?;

        if let Some(path) = &self.path {
            let data = serde_json::to_vec_pretty(&config)
                .map_err(|e| ProxyError::Persistence(e.to_string()))?;
            std::fs::write(path, data).map_err(|e| ProxyError::Persistence(e.to_string()))?;
        }

        *self.write() = config;
        Ok(())
    }
}

fn validate(config: &ProxyConfig) -> Result<(), ProxyError> {
    if config.backends.is_empty() {
        return Err(ProxyError::InvalidConfig(
            "at least one backend must be configured".into(),
        ));
    }
    if config.default_backend.is_empty() {
        return Err(ProxyError::InvalidConfig(
            "a default backend must be configured".into(),
        ));
    }
    if !config
        .backends
        .iter()
        .any(|b| b.name == config.default_backend)
    {
        return Err(ProxyError::InvalidConfig(
            "default backend must exist in the backends list".into(),
        ));
    }
    for (ty, name) in &config.task_routing {
        if !config.backends.iter().any(|b| &b.name == name) {
            return Err(ProxyError::InvalidConfig(format!(
                "task routing for \"{ty}\" references unknown backend: {name}"
            )));
        }
    }
    Ok(())
}
