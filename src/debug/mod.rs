//! Request/response capture for troubleshooting backend traffic.

mod recorder;

pub use recorder::{DebugRecorder, DebugStatus, HttpRecord, RecordedRequest, RecordedResponse};
