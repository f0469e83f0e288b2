//! Veilnet Logging
//!
//! Tracing-subscriber setup shared by the daemon and tests. Filtering
//! comes from `RUST_LOG`, defaulting to `info` for our crates and
//! `warn` for everything else.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str =
    "warn,veilnet_core=info,veilnet_crypto=info,veilnet_contact=info,veilnet_nodedb=info,veilnet_path=info";

/// Install the global subscriber. Returns quietly if one is already
/// set, so tests can call it freely.
pub fn init() {
    init_with_filter(DEFAULT_FILTER)
}

/// Install with an explicit default filter, still overridable through
/// `RUST_LOG`.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
