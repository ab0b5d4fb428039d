//! Request routing and forwarding.
//!
//! Entries are parsed and grouped by type, each group is routed to a
//! backend and forwarded concurrently, and the per-group results are
//! merged back into one response.

mod entries;
mod forwarder;
mod router;
mod upstream;

pub use entries::{group_by_type, merge_results, parse_entries, Entry, TypeGroup};
pub use forwarder::{Attachment, ForwardObserver, Forwarder, NoopObserver, FORWARD_TIMEOUT};
pub use router::Router;
pub use upstream::{check_health, HealthRecord, HealthStatus, HealthTracker, RoundRobin, PROBE_TIMEOUT};
