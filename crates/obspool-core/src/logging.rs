#![forbid(unsafe_code)]

//! Logging plumbing.
//!
//! With the `tracing` feature the `tracing` macros are re-exported here so
//! downstream crates log through one path. Without it this module is empty
//! and call sites are compiled out with `#[cfg(feature = "tracing")]`.
//!
//! The `tracing-json` feature additionally provides [`init_json`], which
//! installs a global JSON subscriber filtered by `RUST_LOG`.

#[cfg(feature = "tracing")]
pub use tracing::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};

/// Install a JSON-formatting global subscriber honoring `RUST_LOG`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
#[cfg(feature = "tracing-json")]
pub fn init_json() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
}
