//! Configuration: an optional `vibe-sync.toml` file layered under
//! environment variables. Environment wins; every knob has a default so a
//! bare `PM_API_URL` + `TRACKER_REPO_ROOT` is enough to start.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmConfig {
    pub api_url: String,
    #[serde(default = "default_pm_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_pm_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub repo_root: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "logs/sync-state.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_min_interval_ms() -> u64 {
    75
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_max_idle_per_host() -> usize {
    8
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            min_request_interval_ms: default_min_interval_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Active-only tick interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Full-sweep interval.
    #[serde(default = "default_full_interval_ms")]
    pub full_interval_ms: u64,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_dedupe_ttl_ms")]
    pub dedupe_cache_ttl_ms: u64,
    /// Overall deadline for one sync cycle.
    #[serde(default = "default_cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
    /// Checkpoint cadence for the full-sync driver.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
}

fn default_tick_interval_ms() -> u64 {
    10_000
}
fn default_full_interval_ms() -> u64 {
    300_000
}
fn default_parallel() -> bool {
    true
}
fn default_max_workers() -> usize {
    5
}
fn default_dedupe_ttl_ms() -> u64 {
    15_000
}
fn default_cycle_deadline_ms() -> u64 {
    900_000
}
fn default_checkpoint_every() -> usize {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            full_interval_ms: default_full_interval_ms(),
            parallel: default_parallel(),
            max_workers: default_max_workers(),
            dedupe_cache_ttl_ms: default_dedupe_ttl_ms(),
            cycle_deadline_ms: default_cycle_deadline_ms(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    MarkDeleted,
    HardDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_action")]
    pub action: ReconcileAction,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_reconcile_interval_ms")]
    pub interval_ms: u64,
}

fn default_reconcile_action() -> ReconcileAction {
    ReconcileAction::MarkDeleted
}
fn default_reconcile_interval_ms() -> u64 {
    3_600_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            action: default_reconcile_action(),
            dry_run: false,
            interval_ms: default_reconcile_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_health_host")]
    pub health_host: String,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// Required for non-loopback binds; ignored on loopback.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}
fn default_health_port() -> u16 {
    8701
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_host: default_health_host(),
            health_port: default_health_port(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pm: PmConfig,
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration: `vibe-sync.toml` next to the working directory if
    /// present, then environment variables layered on top.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::fs::read_to_string("vibe-sync.toml") {
            Ok(text) => {
                Some(toml::from_str::<Config>(&text).map_err(|e| ConfigError::Parse(e.to_string()))?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ConfigError::Io(e.to_string())),
        };
        Self::from_env_over(base)
    }

    /// Build from environment variables alone (no config file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_over(None)
    }

    fn from_env_over(base: Option<Config>) -> Result<Self, ConfigError> {
        let mut cfg = match base {
            Some(cfg) => cfg,
            None => Config {
                pm: PmConfig {
                    api_url: env_str("PM_API_URL").ok_or(ConfigError::Missing("PM_API_URL"))?,
                    request_timeout_ms: default_pm_timeout_ms(),
                },
                tracker: TrackerConfig {
                    repo_root: env_str("TRACKER_REPO_ROOT")
                        .ok_or(ConfigError::Missing("TRACKER_REPO_ROOT"))?,
                },
                agents: AgentsConfig::default(),
                store: StoreConfig::default(),
                http: HttpConfig::default(),
                sync: SyncSettings::default(),
                reconcile: ReconcileConfig::default(),
                daemon: DaemonConfig::default(),
            },
        };

        if let Some(v) = env_str("PM_API_URL") {
            cfg.pm.api_url = v;
        }
        if let Some(v) = env_str("TRACKER_REPO_ROOT") {
            cfg.tracker.repo_root = v;
        }
        if let Some(v) = env_str("AGENTS_API_URL") {
            cfg.agents.api_url = Some(v);
        }
        if let Some(v) = env_str("AGENTS_TOKEN") {
            cfg.agents.token = Some(v);
        }
        if let Some(v) = env_str("DB_PATH") {
            cfg.store.db_path = v;
        }
        if let Some(v) = env_parse("SYNC_INTERVAL_MS")? {
            cfg.sync.full_interval_ms = v;
        }
        if let Some(v) = env_parse::<bool>("PARALLEL_SYNC")? {
            cfg.sync.parallel = v;
        }
        if let Some(v) = env_parse("MAX_WORKERS")? {
            cfg.sync.max_workers = v;
        }
        if let Some(v) = env_parse("HEALTH_PORT")? {
            cfg.daemon.health_port = v;
        }
        if let Some(v) = env_str("RECONCILIATION_ACTION") {
            cfg.reconcile.action = match v.as_str() {
                "mark_deleted" => ReconcileAction::MarkDeleted,
                "hard_delete" => ReconcileAction::HardDelete,
                other => {
                    return Err(ConfigError::Invalid {
                        name: "RECONCILIATION_ACTION",
                        reason: format!("unknown action `{other}`"),
                    })
                }
            };
        }
        if let Some(v) = env_parse::<bool>("RECONCILIATION_DRY_RUN")? {
            cfg.reconcile.dry_run = v;
        }
        if let Some(v) = env_parse("DEDUPE_CACHE_TTL_MS")? {
            cfg.sync.dedupe_cache_ttl_ms = v;
        }
        if let Some(v) = env_parse("HTTP_MIN_REQUEST_INTERVAL_MS")? {
            cfg.http.min_request_interval_ms = v;
        }
        if let Some(v) = env_parse("HTTP_MAX_RETRY_ATTEMPTS")? {
            cfg.http.max_retry_attempts = v;
        }
        if let Some(v) = env_parse("HTTP_BASE_BACKOFF_MS")? {
            cfg.http.base_backoff_ms = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pm.api_url.is_empty() {
            return Err(ConfigError::Missing("PM_API_URL"));
        }
        if self.tracker.repo_root.is_empty() {
            return Err(ConfigError::Missing("TRACKER_REPO_ROOT"));
        }
        if self.sync.max_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_WORKERS",
                reason: "must be at least 1".into(),
            });
        }
        if self.agents.api_url.is_some() && self.agents.token.is_none() {
            return Err(ConfigError::Invalid {
                name: "AGENTS_TOKEN",
                reason: "required when AGENTS_API_URL is set".into(),
            });
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.store.db_path)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.sync.tick_interval_ms)
    }

    pub fn full_interval(&self) -> Duration {
        Duration::from_millis(self.sync.full_interval_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.sync.cycle_deadline_ms)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_millis(self.sync.dedupe_cache_ttl_ms)
    }
}

fn env_str(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_str(name) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("cannot parse `{raw}`"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            pm: PmConfig {
                api_url: "http://localhost:3000".into(),
                request_timeout_ms: default_pm_timeout_ms(),
            },
            tracker: TrackerConfig {
                repo_root: "/tmp/repo".into(),
            },
            agents: AgentsConfig::default(),
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            sync: SyncSettings::default(),
            reconcile: ReconcileConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = minimal();
        assert_eq!(cfg.http.min_request_interval_ms, 75);
        assert_eq!(cfg.http.max_retry_attempts, 5);
        assert_eq!(cfg.sync.max_workers, 5);
        assert_eq!(cfg.sync.dedupe_cache_ttl_ms, 15_000);
        assert_eq!(cfg.store.db_path, "logs/sync-state.db");
        assert_eq!(cfg.reconcile.action, ReconcileAction::MarkDeleted);
        assert_eq!(cfg.daemon.health_host, "127.0.0.1");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut cfg = minimal();
        cfg.sync.max_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_token_with_agents_url() {
        let mut cfg = minimal();
        cfg.agents.api_url = Some("http://localhost:8283".into());
        assert!(cfg.validate().is_err());
        cfg.agents.token = Some("sk-agents".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_roundtrip() {
        let text = r#"
            [pm]
            api_url = "http://pm.local"

            [tracker]
            repo_root = "/srv/repo"

            [sync]
            max_workers = 3
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.pm.api_url, "http://pm.local");
        assert_eq!(cfg.sync.max_workers, 3);
        // Unspecified sections pick up defaults.
        assert_eq!(cfg.http.base_backoff_ms, 250);
    }
}
