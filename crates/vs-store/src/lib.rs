//! Durable cross-system mapping store.
//!
//! An embedded SQLite database (WAL mode, single writer, concurrent
//! readers) that exclusively owns all persistent state: project rows,
//! issue mapping rows, sync-run history, pending-op intent records, and
//! the project-file upload cache. No other component writes to disk.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use vs_core::status::normalize_title;
use vs_core::types::{
    CanonicalStatus, Issue, PendingOp, PendingOpState, PendingOpType, Priority, Project,
    ProjectFile, SyncRun, SyncRunCounts, SyncRunError, System,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Db(tokio_rusqlite::Error::Rusqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// How many completed sync runs to retain in history.
const RUN_HISTORY_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// MappingStore
// ---------------------------------------------------------------------------

pub struct MappingStore {
    conn: Connection,
}

impl MappingStore {
    /// Open (or create) the store at the given file path. The parent
    /// directory is created if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Corrupt(format!("cannot create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Purely in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS projects (
                        identifier     TEXT PRIMARY KEY,
                        name           TEXT NOT NULL,
                        pm_id          TEXT,
                        fs_path        TEXT,
                        agent_id       TEXT,
                        last_sync_at   INTEGER,
                        metadata_hash  TEXT,
                        archived       INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_projects_pm_id ON projects(pm_id);

                    CREATE TABLE IF NOT EXISTS issues (
                        identifier           TEXT PRIMARY KEY,
                        project              TEXT NOT NULL,
                        title                TEXT NOT NULL,
                        title_norm           TEXT NOT NULL,
                        description          TEXT NOT NULL DEFAULT '',
                        status               TEXT NOT NULL,
                        priority             TEXT NOT NULL,
                        pm_id                TEXT,
                        tracker_id           TEXT,
                        pm_modified_at       INTEGER,
                        tracker_modified_at  INTEGER,
                        pm_status            TEXT,
                        tracker_status       TEXT,
                        parent               TEXT,
                        subissue_count       INTEGER NOT NULL DEFAULT 0,
                        content_hash         TEXT NOT NULL,
                        removed_from_pm      INTEGER NOT NULL DEFAULT 0,
                        removed_from_tracker INTEGER NOT NULL DEFAULT 0,
                        last_sync_at         INTEGER
                    );

                    CREATE INDEX IF NOT EXISTS idx_issues_project      ON issues(project);
                    CREATE INDEX IF NOT EXISTS idx_issues_pm_id       ON issues(project, pm_id);
                    CREATE INDEX IF NOT EXISTS idx_issues_tracker_id  ON issues(project, tracker_id);
                    CREATE INDEX IF NOT EXISTS idx_issues_title_norm  ON issues(project, title_norm);

                    CREATE TABLE IF NOT EXISTS sync_history (
                        id           TEXT PRIMARY KEY,
                        project      TEXT,
                        started_at   INTEGER NOT NULL,
                        completed_at INTEGER,
                        created      INTEGER NOT NULL DEFAULT 0,
                        updated      INTEGER NOT NULL DEFAULT 0,
                        skipped      INTEGER NOT NULL DEFAULT 0,
                        failed       INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_sync_history_started ON sync_history(started_at);

                    CREATE TABLE IF NOT EXISTS sync_errors (
                        run_id     TEXT NOT NULL,
                        project    TEXT,
                        identifier TEXT,
                        operation  TEXT NOT NULL,
                        message    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_sync_errors_run ON sync_errors(run_id);

                    CREATE TABLE IF NOT EXISTS pending_ops (
                        id          TEXT PRIMARY KEY,
                        op_type     TEXT NOT NULL,
                        target      TEXT NOT NULL,
                        payload     TEXT NOT NULL,
                        state       TEXT NOT NULL,
                        result      TEXT,
                        created_at  INTEGER NOT NULL,
                        resolved_at INTEGER
                    );

                    CREATE INDEX IF NOT EXISTS idx_pending_ops_state ON pending_ops(state);

                    CREATE TABLE IF NOT EXISTS project_files (
                        project        TEXT NOT NULL,
                        rel_path       TEXT NOT NULL,
                        content_hash   TEXT NOT NULL,
                        remote_file_id TEXT,
                        size           INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY (project, rel_path)
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        let p = project.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (identifier, name, pm_id, fs_path, agent_id,
                        last_sync_at, metadata_hash, archived)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(identifier) DO UPDATE SET
                        name=excluded.name, pm_id=excluded.pm_id, fs_path=excluded.fs_path,
                        agent_id=excluded.agent_id, last_sync_at=excluded.last_sync_at,
                        metadata_hash=excluded.metadata_hash, archived=excluded.archived",
                    params![
                        p.identifier,
                        p.name,
                        p.pm_id,
                        p.fs_path,
                        p.agent_id,
                        p.last_sync_at,
                        p.metadata_hash,
                        p.archived as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_project(&self, identifier: &str) -> Result<Option<Project>> {
        let id = identifier.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT identifier, name, pm_id, fs_path, agent_id, last_sync_at,
                            metadata_hash, archived
                     FROM projects WHERE identifier = ?1",
                )?;
                let row = stmt
                    .query_row(params![id], |r| {
                        Ok(Project {
                            identifier: r.get(0)?,
                            name: r.get(1)?,
                            pm_id: r.get(2)?,
                            fs_path: r.get(3)?,
                            agent_id: r.get(4)?,
                            last_sync_at: r.get(5)?,
                            metadata_hash: r.get(6)?,
                            archived: r.get::<_, i64>(7)? != 0,
                        })
                    })
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT identifier, name, pm_id, fs_path, agent_id, last_sync_at,
                            metadata_hash, archived
                     FROM projects ORDER BY identifier",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok(Project {
                            identifier: r.get(0)?,
                            name: r.get(1)?,
                            pm_id: r.get(2)?,
                            fs_path: r.get(3)?,
                            agent_id: r.get(4)?,
                            last_sync_at: r.get(5)?,
                            metadata_hash: r.get(6)?,
                            archived: r.get::<_, i64>(7)? != 0,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    pub async fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        let i = issue.clone();
        self.conn
            .call(move |conn| {
                upsert_issue_tx(conn, &i)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Upsert a batch of issues in one transaction. Used at the end of each
    /// orchestrator phase so that a crash never leaves a half-written phase.
    pub async fn batch_upsert_issues(&self, issues: Vec<Issue>) -> Result<()> {
        if issues.is_empty() {
            return Ok(());
        }
        let count = issues.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for issue in &issues {
                    upsert_issue_tx(&tx, issue)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(count, "issue batch persisted");
        Ok(())
    }

    pub async fn get_issue(&self, identifier: &str) -> Result<Option<Issue>> {
        let id = identifier.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached(&format!("{ISSUE_SELECT} WHERE identifier = ?1"))?;
                let row = stmt.query_row(params![id], row_to_issue).optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn project_issues(&self, project: &str) -> Result<Vec<Issue>> {
        let project = project.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached(&format!("{ISSUE_SELECT} WHERE project = ?1"))?;
                let rows = stmt
                    .query_map(params![project], row_to_issue)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// All issues in a project carrying a non-null foreign ID for `system`.
    /// The reconciler uses this to find rows whose upstream entity vanished.
    pub async fn issues_with_foreign_id(&self, project: &str, system: System) -> Result<Vec<Issue>> {
        let project = project.to_string();
        let column = foreign_id_column(system);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{ISSUE_SELECT} WHERE project = ?1 AND {column} IS NOT NULL"
                ))?;
                let rows = stmt
                    .query_map(params![project], row_to_issue)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn find_issue_by_foreign_id(
        &self,
        project: &str,
        system: System,
        foreign_id: &str,
    ) -> Result<Option<Issue>> {
        let project = project.to_string();
        let fid = foreign_id.to_string();
        let column = foreign_id_column(system);
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{ISSUE_SELECT} WHERE project = ?1 AND {column} = ?2"
                ))?;
                let row = stmt.query_row(params![project, fid], row_to_issue).optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn find_issue_by_normalized_title(
        &self,
        project: &str,
        normalized: &str,
    ) -> Result<Option<Issue>> {
        let project = project.to_string();
        let norm = normalized.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{ISSUE_SELECT} WHERE project = ?1 AND title_norm = ?2"
                ))?;
                let row = stmt
                    .query_row(params![project, norm], row_to_issue)
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    pub async fn count_issues(&self, project: &str) -> Result<i64> {
        let project = project.to_string();
        let count = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT COUNT(*) FROM issues WHERE project = ?1")?;
                let count: i64 = stmt.query_row(params![project], |r| r.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    /// High-water mark of `pm_modified_at` across a project's rows; the
    /// orchestrator's `modifiedSince` for incremental fetches.
    pub async fn max_pm_modified_at(&self, project: &str) -> Result<Option<i64>> {
        let project = project.to_string();
        let max = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT MAX(pm_modified_at) FROM issues WHERE project = ?1",
                )?;
                let max: Option<i64> = stmt.query_row(params![project], |r| r.get(0))?;
                Ok(max)
            })
            .await?;
        Ok(max)
    }

    /// Flag a row as removed from one system. The row itself is retained;
    /// hard deletion is the reconciler's decision alone.
    pub async fn mark_issue_removed(&self, identifier: &str, system: System) -> Result<()> {
        let id = identifier.to_string();
        let column = match system {
            System::Pm => "removed_from_pm",
            System::Tracker => "removed_from_tracker",
            System::Agents => return Ok(()),
        };
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!("UPDATE issues SET {column} = 1 WHERE identifier = ?1"),
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Hard-delete a row. Only the reconciler's hard-delete mode calls this.
    pub async fn delete_issue(&self, identifier: &str) -> Result<bool> {
        let id = identifier.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM issues WHERE identifier = ?1", params![id])?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Sync runs
    // -----------------------------------------------------------------------

    pub async fn start_sync_run(&self, project: Option<&str>) -> Result<SyncRun> {
        let run = SyncRun::start(project.map(String::from));
        let r = run.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_history (id, project, started_at) VALUES (?1,?2,?3)",
                    params![r.id.to_string(), r.project, r.started_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(run)
    }

    pub async fn complete_sync_run(&self, run_id: Uuid, counts: SyncRunCounts) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_history
                     SET completed_at=?2, created=?3, updated=?4, skipped=?5, failed=?6
                     WHERE id=?1",
                    params![
                        run_id.to_string(),
                        now,
                        counts.created as i64,
                        counts.updated as i64,
                        counts.skipped as i64,
                        counts.failed as i64,
                    ],
                )?;
                // Opportunistic retention: drop runs beyond the newest N.
                conn.execute(
                    "DELETE FROM sync_history WHERE id NOT IN (
                        SELECT id FROM sync_history ORDER BY started_at DESC LIMIT ?1)",
                    params![RUN_HISTORY_LIMIT],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn record_error(&self, error: &SyncRunError) -> Result<()> {
        let e = error.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_errors (run_id, project, identifier, operation, message)
                     VALUES (?1,?2,?3,?4,?5)",
                    params![
                        e.run_id.to_string(),
                        e.project,
                        e.identifier,
                        e.operation,
                        e.message
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn run_errors(&self, run_id: Uuid) -> Result<Vec<SyncRunError>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT run_id, project, identifier, operation, message
                     FROM sync_errors WHERE run_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![run_id.to_string()], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, Option<String>>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(run_id, project, identifier, operation, message)| {
                Ok(SyncRunError {
                    run_id: Uuid::parse_str(&run_id)
                        .map_err(|e| StoreError::Corrupt(format!("bad run id: {e}")))?,
                    project,
                    identifier,
                    operation,
                    message,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Pending ops
    // -----------------------------------------------------------------------

    pub async fn create_pending_op(&self, op: &PendingOp) -> Result<()> {
        let o = op.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_ops (id, op_type, target, payload, state, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        o.id.to_string(),
                        o.op_type.as_str(),
                        o.target.as_str(),
                        o.payload.to_string(),
                        state_str(o.state),
                        o.created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_pending_op_succeeded(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        self.resolve_pending_op(id, PendingOpState::Succeeded, result).await
    }

    pub async fn mark_pending_op_failed(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        self.resolve_pending_op(id, PendingOpState::Failed, result).await
    }

    /// Replace a pending op's payload while leaving it unresolved. The
    /// full-sync driver checkpoints its progress this way.
    pub async fn update_pending_op_payload(
        &self,
        id: Uuid,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_ops SET payload=?2 WHERE id=?1 AND state='pending'",
                    params![id.to_string(), payload.to_string()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn resolve_pending_op(
        &self,
        id: Uuid,
        state: PendingOpState,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_ops SET state=?2, result=?3, resolved_at=?4 WHERE id=?1",
                    params![
                        id.to_string(),
                        state_str(state),
                        result.map(|v| v.to_string()),
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Pending ops never resolved: the crash survivors the startup recovery
    /// pass replays or compensates.
    pub async fn list_unresolved_pending_ops(&self) -> Result<Vec<PendingOp>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, op_type, target, payload, state, created_at, resolved_at
                     FROM pending_ops WHERE state = 'pending' ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, String>(4)?,
                            r.get::<_, i64>(5)?,
                            r.get::<_, Option<i64>>(6)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for (id, op_type, target, payload, state, created_at, resolved_at) in rows {
            let Some(op_type) = PendingOpType::from_str(&op_type) else {
                warn!(op_type, "unknown pending op type in store, skipping");
                continue;
            };
            ops.push(PendingOp {
                id: Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("bad pending op id: {e}")))?,
                op_type,
                target: parse_system(&target)?,
                payload: serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Corrupt(format!("bad pending op payload: {e}")))?,
                state: parse_state(&state)?,
                created_at,
                resolved_at,
            });
        }
        Ok(ops)
    }

    // -----------------------------------------------------------------------
    // Project files
    // -----------------------------------------------------------------------

    pub async fn upsert_project_file(&self, file: &ProjectFile) -> Result<()> {
        let f = file.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO project_files (project, rel_path, content_hash, remote_file_id, size)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(project, rel_path) DO UPDATE SET
                        content_hash=excluded.content_hash,
                        remote_file_id=excluded.remote_file_id,
                        size=excluded.size",
                    params![f.project, f.rel_path, f.content_hash, f.remote_file_id, f.size],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_project_file(&self, project: &str, rel_path: &str) -> Result<bool> {
        let project = project.to_string();
        let rel_path = rel_path.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM project_files WHERE project = ?1 AND rel_path = ?2",
                    params![project, rel_path],
                )?;
                Ok(n)
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn project_file(&self, project: &str, rel_path: &str) -> Result<Option<ProjectFile>> {
        let project = project.to_string();
        let rel_path = rel_path.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT project, rel_path, content_hash, remote_file_id, size
                     FROM project_files WHERE project = ?1 AND rel_path = ?2",
                )?;
                let row = stmt
                    .query_row(params![project, rel_path], |r| {
                        Ok(ProjectFile {
                            project: r.get(0)?,
                            rel_path: r.get(1)?,
                            content_hash: r.get(2)?,
                            remote_file_id: r.get(3)?,
                            size: r.get(4)?,
                        })
                    })
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Row plumbing
// ---------------------------------------------------------------------------

const ISSUE_SELECT: &str = "SELECT identifier, project, title, description, status, priority,
        pm_id, tracker_id, pm_modified_at, tracker_modified_at, pm_status, tracker_status,
        parent, subissue_count, content_hash, removed_from_pm, removed_from_tracker, last_sync_at
     FROM issues";

fn foreign_id_column(system: System) -> &'static str {
    match system {
        System::Pm => "pm_id",
        System::Tracker => "tracker_id",
        System::Agents => "pm_id", // agents carry no per-issue foreign id
    }
}

fn upsert_issue_tx(conn: &rusqlite::Connection, issue: &Issue) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO issues (identifier, project, title, title_norm, description, status,
            priority, pm_id, tracker_id, pm_modified_at, tracker_modified_at, pm_status,
            tracker_status, parent, subissue_count, content_hash, removed_from_pm,
            removed_from_tracker, last_sync_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
         ON CONFLICT(identifier) DO UPDATE SET
            project=excluded.project, title=excluded.title, title_norm=excluded.title_norm,
            description=excluded.description, status=excluded.status, priority=excluded.priority,
            pm_id=excluded.pm_id, tracker_id=excluded.tracker_id,
            pm_modified_at=CASE
                WHEN excluded.pm_modified_at IS NULL THEN issues.pm_modified_at
                WHEN issues.pm_modified_at IS NULL THEN excluded.pm_modified_at
                ELSE MAX(issues.pm_modified_at, excluded.pm_modified_at) END,
            tracker_modified_at=CASE
                WHEN excluded.tracker_modified_at IS NULL THEN issues.tracker_modified_at
                WHEN issues.tracker_modified_at IS NULL THEN excluded.tracker_modified_at
                ELSE MAX(issues.tracker_modified_at, excluded.tracker_modified_at) END,
            pm_status=excluded.pm_status, tracker_status=excluded.tracker_status,
            parent=excluded.parent, subissue_count=excluded.subissue_count,
            content_hash=excluded.content_hash, removed_from_pm=excluded.removed_from_pm,
            removed_from_tracker=excluded.removed_from_tracker, last_sync_at=excluded.last_sync_at",
    )?;
    stmt.execute(params![
        issue.identifier,
        issue.project,
        issue.title,
        normalize_title(&issue.title),
        issue.description,
        issue.status.name(),
        issue.priority.name(),
        issue.pm_id,
        issue.tracker_id,
        issue.pm_modified_at,
        issue.tracker_modified_at,
        issue.pm_status,
        issue.tracker_status,
        issue.parent,
        issue.subissue_count,
        issue.content_hash,
        issue.removed_from_pm as i64,
        issue.removed_from_tracker as i64,
        issue.last_sync_at,
    ])?;
    Ok(())
}

fn row_to_issue(r: &Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = r.get(4)?;
    let priority: String = r.get(5)?;
    Ok(Issue {
        identifier: r.get(0)?,
        project: r.get(1)?,
        title: r.get(2)?,
        description: r.get(3)?,
        status: CanonicalStatus::from_name(&status).unwrap_or(CanonicalStatus::Backlog),
        priority: parse_priority(&priority),
        pm_id: r.get(6)?,
        tracker_id: r.get(7)?,
        pm_modified_at: r.get(8)?,
        tracker_modified_at: r.get(9)?,
        pm_status: r.get(10)?,
        tracker_status: r.get(11)?,
        parent: r.get(12)?,
        subissue_count: r.get(13)?,
        content_hash: r.get(14)?,
        removed_from_pm: r.get::<_, i64>(15)? != 0,
        removed_from_tracker: r.get::<_, i64>(16)? != 0,
        last_sync_at: r.get(17)?,
    })
}

fn parse_priority(name: &str) -> Priority {
    match name {
        "Urgent" => Priority::Urgent,
        "High" => Priority::High,
        "Medium" => Priority::Medium,
        "Low" => Priority::Low,
        _ => Priority::NoPriority,
    }
}

fn state_str(state: PendingOpState) -> &'static str {
    match state {
        PendingOpState::Pending => "pending",
        PendingOpState::Succeeded => "succeeded",
        PendingOpState::Failed => "failed",
    }
}

fn parse_state(s: &str) -> Result<PendingOpState> {
    match s {
        "pending" => Ok(PendingOpState::Pending),
        "succeeded" => Ok(PendingOpState::Succeeded),
        "failed" => Ok(PendingOpState::Failed),
        other => Err(StoreError::Corrupt(format!("bad pending op state `{other}`"))),
    }
}

fn parse_system(s: &str) -> Result<System> {
    match s {
        "pm" => Ok(System::Pm),
        "tracker" => Ok(System::Tracker),
        "agents" => Ok(System::Agents),
        other => Err(StoreError::Corrupt(format!("bad system `{other}`"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vs_core::types::content_hash;

    fn sample_issue(identifier: &str, project: &str) -> Issue {
        let mut issue = Issue::new(identifier, project);
        issue.title = "Fix login".into();
        issue.description = "bug".into();
        issue.status = CanonicalStatus::Backlog;
        issue.priority = Priority::High;
        issue.pm_modified_at = Some(1000);
        issue.rehash();
        issue
    }

    #[tokio::test]
    async fn project_roundtrip() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let mut p = Project::new("HVSYN", "Vibe Sync");
        p.pm_id = Some("pm-123".into());
        store.upsert_project(&p).await.unwrap();

        let loaded = store.get_project("HVSYN").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Vibe Sync");
        assert_eq!(loaded.pm_id.as_deref(), Some("pm-123"));
        assert!(!loaded.archived);

        // Upsert replaces mutable fields but keeps the identifier stable.
        p.agent_id = Some("agent-9".into());
        store.upsert_project(&p).await.unwrap();
        let loaded = store.get_project("HVSYN").await.unwrap().unwrap();
        assert_eq!(loaded.agent_id.as_deref(), Some("agent-9"));
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn issue_upsert_and_lookups() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let mut issue = sample_issue("HVSYN-10", "HVSYN");
        issue.pm_id = Some("pm-i-1".into());
        issue.tracker_id = Some("bd-ab12c".into());
        store.upsert_issue(&issue).await.unwrap();

        let by_id = store.get_issue("HVSYN-10").await.unwrap().unwrap();
        assert_eq!(by_id.title, "Fix login");
        assert_eq!(
            by_id.content_hash,
            content_hash("Fix login", "bug", CanonicalStatus::Backlog)
        );

        let by_pm = store
            .find_issue_by_foreign_id("HVSYN", System::Pm, "pm-i-1")
            .await
            .unwrap();
        assert!(by_pm.is_some());

        let by_tracker = store
            .find_issue_by_foreign_id("HVSYN", System::Tracker, "bd-ab12c")
            .await
            .unwrap();
        assert_eq!(by_tracker.unwrap().identifier, "HVSYN-10");

        let by_title = store
            .find_issue_by_normalized_title("HVSYN", "fix login")
            .await
            .unwrap();
        assert!(by_title.is_some());

        assert!(store
            .find_issue_by_normalized_title("HVSYN", "unrelated")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn modified_at_is_monotonic() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let mut issue = sample_issue("HVSYN-11", "HVSYN");
        issue.pm_modified_at = Some(2000);
        store.upsert_issue(&issue).await.unwrap();

        // A stale write must not move the clock backwards.
        issue.pm_modified_at = Some(1500);
        store.upsert_issue(&issue).await.unwrap();
        let loaded = store.get_issue("HVSYN-11").await.unwrap().unwrap();
        assert_eq!(loaded.pm_modified_at, Some(2000));
    }

    #[tokio::test]
    async fn batch_upsert_is_transactional() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let issues: Vec<Issue> = (0..20)
            .map(|n| sample_issue(&format!("HVSYN-{n}"), "HVSYN"))
            .collect();
        store.batch_upsert_issues(issues).await.unwrap();
        assert_eq!(store.project_issues("HVSYN").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn removal_flags_and_hard_delete() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let mut issue = sample_issue("HVSYN-12", "HVSYN");
        issue.tracker_id = Some("bd-x".into());
        store.upsert_issue(&issue).await.unwrap();

        store
            .mark_issue_removed("HVSYN-12", System::Tracker)
            .await
            .unwrap();
        let loaded = store.get_issue("HVSYN-12").await.unwrap().unwrap();
        assert!(loaded.removed_from_tracker);
        assert!(!loaded.removed_from_pm);

        assert!(store.delete_issue("HVSYN-12").await.unwrap());
        assert!(store.get_issue("HVSYN-12").await.unwrap().is_none());
        assert!(!store.delete_issue("HVSYN-12").await.unwrap());
    }

    #[tokio::test]
    async fn issues_with_foreign_id_filters_nulls() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let mut linked = sample_issue("HVSYN-1", "HVSYN");
        linked.tracker_id = Some("bd-1".into());
        store.upsert_issue(&linked).await.unwrap();
        store
            .upsert_issue(&sample_issue("HVSYN-2", "HVSYN"))
            .await
            .unwrap();

        let rows = store
            .issues_with_foreign_id("HVSYN", System::Tracker)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, "HVSYN-1");
    }

    #[tokio::test]
    async fn sync_run_lifecycle() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let run = store.start_sync_run(Some("HVSYN")).await.unwrap();

        store
            .record_error(&SyncRunError {
                run_id: run.id,
                project: Some("HVSYN".into()),
                identifier: Some("HVSYN-3".into()),
                operation: "patch_pm".into(),
                message: "validation failed".into(),
            })
            .await
            .unwrap();

        let counts = SyncRunCounts {
            created: 1,
            updated: 2,
            skipped: 3,
            failed: 1,
        };
        store.complete_sync_run(run.id, counts).await.unwrap();

        let errors = store.run_errors(run.id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].operation, "patch_pm");
    }

    #[tokio::test]
    async fn pending_op_lifecycle() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let op = PendingOp::new(
            PendingOpType::CreateIssue,
            System::Tracker,
            serde_json::json!({"identifier": "HVSYN-12"}),
        );
        store.create_pending_op(&op).await.unwrap();

        let unresolved = store.list_unresolved_pending_ops().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].op_type, PendingOpType::CreateIssue);
        assert_eq!(unresolved[0].payload["identifier"], "HVSYN-12");

        store
            .mark_pending_op_succeeded(op.id, Some(serde_json::json!({"id": "bd-9"})))
            .await
            .unwrap();
        assert!(store.list_unresolved_pending_ops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_file_cache() {
        let store = MappingStore::open_in_memory().await.unwrap();
        let file = ProjectFile {
            project: "HVSYN".into(),
            rel_path: "notes/design.md".into(),
            content_hash: "abc".into(),
            remote_file_id: Some("rf-1".into()),
            size: 512,
        };
        store.upsert_project_file(&file).await.unwrap();

        let loaded = store
            .project_file("HVSYN", "notes/design.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.remote_file_id.as_deref(), Some("rf-1"));

        assert!(store
            .delete_project_file("HVSYN", "notes/design.md")
            .await
            .unwrap());
        assert!(store
            .project_file("HVSYN", "notes/design.md")
            .await
            .unwrap()
            .is_none());
    }
}
