//! Core types for the vibe-sync engine: canonical issue/project model,
//! status and priority translation tables, the error taxonomy shared by
//! every component, and configuration loading.

pub mod config;
pub mod error;
pub mod status;
pub mod types;

pub use config::Config;
pub use error::{ErrorClass, SyncError};
pub use types::{
    content_hash, stable_hash, CanonicalStatus, Issue, PendingOp, PendingOpState, PendingOpType,
    Priority, Project, ProjectFile, SyncRun, SyncRunCounts, SyncRunError, System,
};
