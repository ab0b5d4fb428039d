//! Backend registry storage.
//!
//! Provides thread-safe storage for the backend set, default backend, and
//! type routing table, persisted to a JSON config file.

mod registry;

pub use registry::{Backend, ProxyConfig, Registry};
