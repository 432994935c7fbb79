//! Observability for the sync engine
//!
//! Structured logging through `tracing`, with a runtime-adjustable level
//! driven by the device debug level.

pub mod logging;

pub use logging::{init_default_logging, init_logging, DebugLevel, LogFormat, LogLevelHandle};

// Span macros for structured logging
pub use logging::{engine_span, twin_span};
