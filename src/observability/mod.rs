//! Observability
//!
//! Structured logging setup and the span macros used by the client.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{client_span, messenger_span};
