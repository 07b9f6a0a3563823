use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// The three external systems the engine keeps consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum System {
    Pm,
    Tracker,
    Agents,
}

impl System {
    pub fn as_str(&self) -> &'static str {
        match self {
            System::Pm => "pm",
            System::Tracker => "tracker",
            System::Agents => "agents",
        }
    }
}

impl std::fmt::Display for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CanonicalStatus
// ---------------------------------------------------------------------------

/// Internal status vocabulary. Every external status maps into (and back out
/// of) this enum; no component outside the translation layer ever touches a
/// raw external status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Backlog,
    Todo,
    InProgress,
    InReview,
    Done,
    Canceled,
}

impl CanonicalStatus {
    /// Stable name used in content hashes and `host:` disambiguation labels.
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalStatus::Backlog => "Backlog",
            CanonicalStatus::Todo => "Todo",
            CanonicalStatus::InProgress => "InProgress",
            CanonicalStatus::InReview => "InReview",
            CanonicalStatus::Done => "Done",
            CanonicalStatus::Canceled => "Canceled",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Backlog" => Some(CanonicalStatus::Backlog),
            "Todo" => Some(CanonicalStatus::Todo),
            "InProgress" => Some(CanonicalStatus::InProgress),
            "InReview" => Some(CanonicalStatus::InReview),
            "Done" => Some(CanonicalStatus::Done),
            "Canceled" => Some(CanonicalStatus::Canceled),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    #[default]
    NoPriority,
}

impl Priority {
    /// Tracker encodes priority as an integer 0 (urgent) .. 4 (none).
    pub fn to_tracker(&self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
            Priority::NoPriority => 4,
        }
    }

    /// Out-of-range values collapse to `NoPriority` rather than erroring;
    /// the journal is hand-editable and garbage shows up in practice.
    pub fn from_tracker(value: i64) -> Self {
        match value {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Medium,
            3 => Priority::Low,
            _ => Priority::NoPriority,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Urgent => "Urgent",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
            Priority::NoPriority => "NoPriority",
        }
    }

    /// Parse the PM's priority spelling; anything unrecognized is
    /// `NoPriority`.
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "Urgent" => Priority::Urgent,
            "High" => Priority::High,
            "Medium" => Priority::Medium,
            "Low" => Priority::Low,
            _ => Priority::NoPriority,
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A managed project, keyed by the PM's stable project identifier
/// (uppercase letters plus an optional suffix, e.g. `HVSYN`).
///
/// The identifier is immutable once persisted. At most one agent is bound
/// per project. `fs_path`, when present, must be an absolute path to an
/// existing directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub identifier: String,
    pub name: String,
    pub pm_id: Option<String>,
    pub fs_path: Option<String>,
    pub agent_id: Option<String>,
    /// Unix millis of the last completed sync run for this project.
    pub last_sync_at: Option<i64>,
    /// Hash of project metadata (name, description, archive flag) used by
    /// the scheduler to detect changes without fetching issues.
    pub metadata_hash: Option<String>,
    pub archived: bool,
}

impl Project {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            pm_id: None,
            fs_path: None,
            agent_id: None,
            last_sync_at: None,
            metadata_hash: None,
            archived: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A mapped issue row. Keyed by the canonical identifier: the PM identifier
/// when available, else a synthetic `trk-<tracker id>` key minted on first
/// observation from the Tracker side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub identifier: String,
    pub project: String,
    pub title: String,
    pub description: String,
    pub status: CanonicalStatus,
    pub priority: Priority,
    pub pm_id: Option<String>,
    pub tracker_id: Option<String>,
    /// Per-system modification clocks, Unix millis. Monotonic non-decreasing.
    pub pm_modified_at: Option<i64>,
    pub tracker_modified_at: Option<i64>,
    /// Raw status snapshots as last seen on each side.
    pub pm_status: Option<String>,
    pub tracker_status: Option<String>,
    /// Canonical identifier of the parent issue, if linked.
    pub parent: Option<String>,
    pub subissue_count: i64,
    /// Hash of (title, description, canonical status) as of the last
    /// successfully-persisted state.
    pub content_hash: String,
    pub removed_from_pm: bool,
    pub removed_from_tracker: bool,
    pub last_sync_at: Option<i64>,
}

impl Issue {
    pub fn new(identifier: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            project: project.into(),
            title: String::new(),
            description: String::new(),
            status: CanonicalStatus::Backlog,
            priority: Priority::NoPriority,
            pm_id: None,
            tracker_id: None,
            pm_modified_at: None,
            tracker_modified_at: None,
            pm_status: None,
            tracker_status: None,
            parent: None,
            subissue_count: 0,
            content_hash: String::new(),
            removed_from_pm: false,
            removed_from_tracker: false,
            last_sync_at: None,
        }
    }

    /// Recompute and store the content hash from the current fields.
    pub fn rehash(&mut self) {
        self.content_hash = content_hash(&self.title, &self.description, self.status);
    }

    pub fn foreign_id(&self, system: System) -> Option<&str> {
        match system {
            System::Pm => self.pm_id.as_deref(),
            System::Tracker => self.tracker_id.as_deref(),
            System::Agents => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Content hash
// ---------------------------------------------------------------------------

/// FNV-1a 64-bit over the given parts, joined with a 0x1F unit separator
/// so field boundaries cannot bleed. Rendered as 16 hex chars; the result
/// only ever compares equal/unequal, so collision resistance beyond that
/// is not required.
pub fn stable_hash(parts: &[&str]) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = OFFSET;
    let mut first = true;
    for part in parts {
        if !first {
            h ^= 0x1f;
            h = h.wrapping_mul(PRIME);
        }
        first = false;
        for &b in part.as_bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(PRIME);
        }
    }
    format!("{:016x}", h)
}

/// Stable hash of `title ∥ 0x1F ∥ description ∥ 0x1F ∥ canonical status`.
///
/// Priority is deliberately excluded so that priority-only edits do not
/// churn downstream propagation.
pub fn content_hash(title: &str, description: &str, status: CanonicalStatus) -> String {
    stable_hash(&[title, description, status.name()])
}

// ---------------------------------------------------------------------------
// SyncRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunCounts {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SyncRunCounts {
    pub fn merge(&mut self, other: &SyncRunCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// One recorded sync run: a single project pass or a full-sync sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub project: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub counts: SyncRunCounts,
}

impl SyncRun {
    pub fn start(project: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project,
            started_at: Utc::now().timestamp_millis(),
            completed_at: None,
            counts: SyncRunCounts::default(),
        }
    }
}

/// A structured error recorded against a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunError {
    pub run_id: Uuid,
    pub project: Option<String>,
    pub identifier: Option<String>,
    pub operation: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// PendingOp
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOpState {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOpType {
    CreateIssue,
    UpdateIssue,
    DeleteIssue,
    LinkParent,
    UpdateMemory,
    SyncFiles,
    FullSync,
}

impl PendingOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOpType::CreateIssue => "create_issue",
            PendingOpType::UpdateIssue => "update_issue",
            PendingOpType::DeleteIssue => "delete_issue",
            PendingOpType::LinkParent => "link_parent",
            PendingOpType::UpdateMemory => "update_memory",
            PendingOpType::SyncFiles => "sync_files",
            PendingOpType::FullSync => "full_sync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create_issue" => Some(PendingOpType::CreateIssue),
            "update_issue" => Some(PendingOpType::UpdateIssue),
            "delete_issue" => Some(PendingOpType::DeleteIssue),
            "link_parent" => Some(PendingOpType::LinkParent),
            "update_memory" => Some(PendingOpType::UpdateMemory),
            "sync_files" => Some(PendingOpType::SyncFiles),
            "full_sync" => Some(PendingOpType::FullSync),
            _ => None,
        }
    }
}

/// Durable intent record bracketing a remote mutation and the local mapping
/// write that follows it. Created immediately before the mutation, resolved
/// in the same logical step; survivors found at startup are replayed or
/// compensated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
    pub id: Uuid,
    pub op_type: PendingOpType,
    pub target: System,
    pub payload: serde_json::Value,
    pub state: PendingOpState,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl PendingOp {
    pub fn new(op_type: PendingOpType, target: System, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type,
            target,
            payload,
            state: PendingOpState::Pending,
            created_at: Utc::now().timestamp_millis(),
            resolved_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectFile
// ---------------------------------------------------------------------------

/// Derived cache row for the agent-memory file upload side: which local file
/// maps to which remote file, with the content hash that was uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub project: String,
    pub rel_path: String,
    pub content_hash: String,
    pub remote_file_id: Option<String>,
    pub size: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
