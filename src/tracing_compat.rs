//! Central re-export point for structured logging.
//!
//! Core modules import logging macros from here rather than from `tracing`
//! directly, so the logging backend can be swapped or feature-gated in one
//! place without touching call sites.

pub use tracing::{debug, error, info, trace, warn};
