//! Common utilities and helpers

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogLevel, LoggingConfig};
pub use time::{format_duration, TimeParser};
