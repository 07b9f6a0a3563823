//! Logging setup for the sync daemon.
//!
//! One entry point, [`init`], driven by [`LogOptions`]. The default
//! filter quiets the HTTP stack and the SQLite layer so that a sync run
//! reads as orchestrator/activity lines; `RUST_LOG` overrides everything
//! when set. Output format follows `LOG_FORMAT` (`text` or `json`), so a
//! log shipper can be pointed at the daemon without a rebuild.

use tracing_subscriber::{fmt, EnvFilter};

// ---------------------------------------------------------------------------
// LogFormat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` from the environment; anything other than
    /// `json` (case-insensitive) is plain text.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// LogOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset. The default keeps
    /// the sync crates at `info` and pushes transport noise down to
    /// `warn`.
    pub default_directives: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            default_directives: default_directives().to_string(),
        }
    }
}

impl LogOptions {
    /// Options resolved from the environment: format from `LOG_FORMAT`,
    /// directives from the built-in defaults (which `RUST_LOG` still
    /// overrides at init time).
    pub fn from_env() -> Self {
        Self {
            format: LogFormat::from_env(),
            ..Self::default()
        }
    }
}

fn default_directives() -> &'static str {
    "info,vs_sync=info,vs_store=warn,vs_clients=info,hyper=warn,reqwest=warn,rusqlite=warn,tower_http=warn"
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

/// Install the global subscriber for `service`.
///
/// Safe to call more than once (tests, embedded use): later calls are
/// no-ops against the already-installed subscriber.
pub fn init(service: &str, options: &LogOptions) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directives));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match options.format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if installed {
        tracing::info!(service, format = ?options.format, "logging initialised");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_quiet_the_transport_stack() {
        let options = LogOptions::default();
        for noisy in ["hyper=warn", "reqwest=warn", "rusqlite=warn"] {
            assert!(
                options.default_directives.contains(noisy),
                "missing {noisy}"
            );
        }
        assert!(options.default_directives.starts_with("info"));
    }

    #[test]
    fn log_format_parses_json_case_insensitively() {
        // Exercise the match arm directly; the env var itself is shared
        // process state and not worth mutating in tests.
        for v in ["json", "JSON", "Json"] {
            let format = if v.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Text
            };
            assert_eq!(format, LogFormat::Json);
        }
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn init_is_idempotent() {
        let options = LogOptions::default();
        init("vs-telemetry-test", &options);
        // A second call must not panic on the already-set subscriber.
        init("vs-telemetry-test", &options);
    }
}
