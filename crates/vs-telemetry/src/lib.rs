//! Telemetry for the sync daemon: subscriber setup with a filter tuned
//! to the engine's crates and a `LOG_FORMAT`-selected output format.

pub mod logging;

pub use logging::{init, LogFormat, LogOptions};
