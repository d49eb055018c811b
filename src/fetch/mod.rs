//! Network-facing building blocks: retry schedule, HTTP client, payload sinks

pub mod backoff;
pub mod client;
pub mod sink;

pub use backoff::{is_retryable_status, parse_retry_after, BackoffPolicy, RETRYABLE_STATUS_CODES};
pub use client::{HttpClient, HttpResponse, ReqwestClient};
pub use sink::{DirectorySink, MemorySink, PayloadSink};
