//! Client for the git-resident issue tracker: a CLI for reads and updates
//! plus direct appends to the append-only JSONL journal for creates.
//!
//! Journal writes are the reliable path; after each append the client runs
//! the tracker's import step so the CLI-visible database catches up. The
//! CLI must never be invoked concurrently on the same repository, so every
//! invocation holds the per-repo mutex.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vs_core::error::SyncError;

const JOURNAL_REL_PATH: &str = ".beads/issues.jsonl";
const DB_REL_PATH: &str = ".beads/beads.db";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One journal/CLI issue. `created_at`/`updated_at` are RFC3339 strings in
/// the journal; [`TrackerIssue::updated_at_millis`] converts for clock
/// comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: i64,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_issue_type() -> String {
    "task".to_string()
}

impl TrackerIssue {
    pub fn updated_at_millis(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }
}

#[derive(Debug, Clone)]
pub struct NewTrackerIssue {
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: i64,
    pub issue_type: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    pub status: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
}

impl TrackerUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TrackerClient {
    repo_root: PathBuf,
    bin: String,
    /// Serialises CLI invocations per repository.
    cli_lock: Arc<Mutex<()>>,
}

impl TrackerClient {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let client = Self {
            repo_root,
            bin: "bd".to_string(),
            cli_lock: Arc::new(Mutex::new(())),
        };
        client.check_permissions();
        client
    }

    /// Override the CLI binary name (tests point this at a stub script).
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    pub fn journal_path(&self) -> PathBuf {
        self.repo_root.join(JOURNAL_REL_PATH)
    }

    /// Log a descriptive warning when the tracker's critical files exist
    /// but this process cannot read them; every operation after that would
    /// fail with a much less helpful error.
    fn check_permissions(&self) {
        for rel in [JOURNAL_REL_PATH, DB_REL_PATH] {
            let path = self.repo_root.join(rel);
            if path.exists() && std::fs::File::open(&path).is_err() {
                warn!(
                    path = %path.display(),
                    "tracker file exists but is not readable; check ownership and mode"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // CLI plumbing
    // -----------------------------------------------------------------------

    async fn run_cli(&self, operation: &'static str, args: &[&str]) -> Result<String, SyncError> {
        let _guard = self.cli_lock.lock().await;
        debug!(operation, ?args, "tracker cli invocation");

        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                SyncError::unavailable("tracker", operation, format!("cannot spawn `{}`: {e}", self.bin))
                    .with_source(e)
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}\n{stderr}");
        Err(SyncError::permanent(
            "tracker",
            operation,
            format!(
                "cli exited with {}: {}",
                output.status,
                combined.trim()
            ),
        ))
    }

    pub async fn init(&self) -> Result<(), SyncError> {
        self.run_cli("init", &["init", "--no-daemon"]).await?;
        Ok(())
    }

    /// Run the reconcile-to-database step. `rename_on_import` is the
    /// one-shot recovery for prefix mismatches.
    pub async fn reconcile(&self, rename_on_import: bool) -> Result<(), SyncError> {
        let args: &[&str] = if rename_on_import {
            &["sync", "--import-only", "--rename-on-import"]
        } else {
            &["sync", "--import-only"]
        };
        self.run_cli("reconcile", args).await?;
        Ok(())
    }

    pub async fn import(&self, path: &Path) -> Result<(), SyncError> {
        let path = path.to_string_lossy().into_owned();
        self.run_cli("import", &["import", "-i", &path, "--no-daemon"])
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    async fn try_list(&self, allow_stale: bool) -> Result<Vec<TrackerIssue>, SyncError> {
        let args: &[&str] = if allow_stale {
            &["list", "--json", "--limit", "0", "--all", "--allow-stale"]
        } else {
            &["list", "--json", "--limit", "0", "--all"]
        };
        let stdout = self.run_cli("list", args).await?;
        parse_issue_list(&stdout)
    }

    /// List every issue, recovering from the two known database failure
    /// modes: "out of sync with journal" gets one reconcile-then-retry
    /// (falling back to `--allow-stale` if the retry still fails the same
    /// way), and "prefix mismatch" gets the rename-on-import variant once.
    pub async fn list_issues(&self) -> Result<Vec<TrackerIssue>, SyncError> {
        match self.try_list(false).await {
            Ok(issues) => Ok(issues),
            Err(e) if is_out_of_sync(&e) => {
                info!("tracker database out of sync, reconciling");
                self.reconcile(false).await?;
                match self.try_list(false).await {
                    Ok(issues) => Ok(issues),
                    Err(e2) if is_out_of_sync(&e2) => {
                        warn!("tracker still out of sync after reconcile, reading stale");
                        self.try_list(true).await
                    }
                    other => other,
                }
            }
            Err(e) if is_prefix_mismatch(&e) => {
                info!("tracker prefix mismatch, reconciling with rename");
                self.reconcile(true).await?;
                self.try_list(false).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn show(&self, id: &str) -> Result<Option<TrackerIssue>, SyncError> {
        match self.run_cli("show", &["show", id, "--json"]).await {
            Ok(stdout) => {
                let trimmed = stdout.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                serde_json::from_str(trimmed).map(Some).map_err(|e| {
                    SyncError::permanent("tracker", "show", format!("bad issue json: {e}"))
                        .with_source(e)
                })
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn update_issue(
        &self,
        id: &str,
        update: &TrackerUpdate,
    ) -> Result<TrackerIssue, SyncError> {
        let mut args: Vec<String> = vec!["update".into(), id.into()];
        if let Some(status) = &update.status {
            args.push("--status".into());
            args.push(status.clone());
        }
        if let Some(title) = &update.title {
            args.push("--title".into());
            args.push(title.clone());
        }
        if let Some(description) = &update.description {
            args.push("--description".into());
            args.push(description.clone());
        }
        if let Some(priority) = update.priority {
            args.push("--priority".into());
            args.push(priority.to_string());
        }
        args.push("--json".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_cli("update", &arg_refs).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| {
            SyncError::permanent("tracker", "update", format!("bad issue json: {e}"))
                .with_source(e)
        })
    }

    pub async fn add_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        self.run_cli("label_add", &["label", "add", id, label, "--no-auto-flush"])
            .await?;
        Ok(())
    }

    pub async fn remove_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        self.run_cli(
            "label_remove",
            &["label", "remove", id, label, "--no-auto-flush"],
        )
        .await?;
        Ok(())
    }

    /// Create an issue by appending one JSON object to the journal, then
    /// reconciling so the CLI sees it. The journal append is the durable
    /// step; a crash between append and reconcile loses nothing because the
    /// next reconcile imports the line.
    pub async fn create_issue(&self, new: &NewTrackerIssue) -> Result<TrackerIssue, SyncError> {
        let now = Utc::now().to_rfc3339();
        let issue = TrackerIssue {
            id: mint_issue_id(),
            title: new.title.clone(),
            status: new.status.clone(),
            priority: new.priority,
            issue_type: new.issue_type.clone(),
            created_at: now.clone(),
            updated_at: now,
            labels: new.labels.clone(),
            description: new.description.clone(),
        };

        let line = serde_json::to_string(&issue).map_err(|e| {
            SyncError::permanent("tracker", "create", e.to_string()).with_source(e)
        })?;

        let path = self.journal_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::unavailable("tracker", "create", format!("cannot create journal dir: {e}"))
                    .with_source(e)
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                SyncError::unavailable(
                    "tracker",
                    "create",
                    format!("cannot open journal {}: {e}", path.display()),
                )
                .with_source(e)
            })?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| {
                SyncError::unavailable("tracker", "create", format!("journal append failed: {e}"))
                    .with_source(e)
            })?;
        file.flush().await.map_err(|e| {
            SyncError::unavailable("tracker", "create", format!("journal flush failed: {e}"))
                .with_source(e)
        })?;

        // Catch the database up. Failure here is not fatal: the line is
        // durable and the next reconcile pass imports it.
        if let Err(e) = self.reconcile(false).await {
            warn!(error = %e, issue = %issue.id, "post-create reconcile failed, import deferred");
        }

        info!(issue = %issue.id, title = %issue.title, "tracker issue created");
        Ok(issue)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_issue_list(stdout: &str) -> Result<Vec<TrackerIssue>, SyncError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed.contains("No issues found") {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| {
        SyncError::permanent("tracker", "list", format!("bad issue list json: {e}")).with_source(e)
    })
}

fn mint_issue_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("bd-{}", &hex[..5])
}

fn is_out_of_sync(e: &SyncError) -> bool {
    let m = e.message.to_ascii_lowercase();
    m.contains("out of sync")
}

fn is_prefix_mismatch(e: &SyncError) -> bool {
    let m = e.message.to_ascii_lowercase();
    m.contains("prefix mismatch")
}

fn is_not_found(e: &SyncError) -> bool {
    let m = e.message.to_ascii_lowercase();
    m.contains("not found") || m.contains("no such issue")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
