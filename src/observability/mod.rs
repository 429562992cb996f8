//! Observability: structured logging setup and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros (`session_span!`, `worker_span!`, `registry_span!`) are
// exported at the crate root.
