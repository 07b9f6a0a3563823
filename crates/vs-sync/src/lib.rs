//! The sync engine: per-project orchestration, deduplication, triggers,
//! agent provisioning, reconciliation, and the full-sync driver.

pub mod dedup;
pub mod full_sync;
pub mod orchestrator;
pub mod provisioner;
pub mod reconciler;
pub mod recovery;
pub mod triggers;

pub use dedup::{DedupCache, DedupIndex};
pub use full_sync::{FullSyncDriver, FullSyncReport};
pub use orchestrator::{FetchPlan, SyncOrchestrator};
pub use provisioner::{AgentProvisioner, build_memory_blocks};
pub use reconciler::{ReconcileReport, Reconciler};
pub use recovery::{PendingOpRecovery, RecoveryReport};
pub use triggers::{
    FileEventKind, FileSyncer, ProjectSyncer, Scheduler, TriggerHub, WebhookEvent,
    handle_webhook,
};
