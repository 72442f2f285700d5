#![forbid(unsafe_code)]

//! Core: change-kind filters and logging for the obspool observer registry.
//!
//! # Role in obspool
//! `obspool-core` is the leaf crate. It owns the [`ChangeFilter`] bitmask that
//! classifies notifications and the [`logging`] facade shared by the runtime.
//!
//! # How it fits in the system
//! The runtime (`obspool-runtime`) stores one `ChangeFilter` per subscription
//! and compares it against the filter carried by each notification. Nothing
//! here knows about topics or observers.

pub mod change;
pub mod logging;

pub use change::ChangeFilter;

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};
