// Poller subsystem: interval-driven metric collection over HTTP, with
// pooled clients and cached cloud tokens.

mod client;
mod cycle;
mod scheduler;
mod tokens;

pub use client::{HttpClientPool, METADATA_TIMEOUT, POLLER_TIMEOUT, metadata_client};
pub use cycle::{build_system_info_record, normalize_endpoint_response, run_cycle};
pub use scheduler::{PollerHandle, PollerScheduler};
pub use tokens::{CachedToken, TOKEN_LATENCY_BUFFER_SECS, TokenCache, TokenRequest, fetch_token};
