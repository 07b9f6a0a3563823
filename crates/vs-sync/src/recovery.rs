//! Startup recovery of unresolved pending ops.
//!
//! A pending op left in `pending` means the process died between a remote
//! mutation and its mapping write. Recovery replays or compensates each
//! survivor so no effect is ever doubled: a create whose tracker entity
//! exists (found by the PM link label) is linked, not recreated.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vs_clients::traits::TrackerApi;
use vs_core::error::SyncError;
use vs_core::status::pm_link_label;
use vs_core::types::{PendingOp, PendingOpType};
use vs_store::MappingStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub examined: usize,
    pub linked: usize,
    pub already_applied: usize,
    pub abandoned: usize,
}

pub struct PendingOpRecovery {
    store: Arc<MappingStore>,
    tracker: Arc<dyn TrackerApi>,
}

impl PendingOpRecovery {
    pub fn new(store: Arc<MappingStore>, tracker: Arc<dyn TrackerApi>) -> Self {
        Self { store, tracker }
    }

    pub async fn run(&self) -> Result<RecoveryReport, SyncError> {
        let survivors = self
            .store
            .list_unresolved_pending_ops()
            .await
            .map_err(store_err)?;
        let mut report = RecoveryReport::default();

        for op in survivors {
            // Full-sync checkpoints are owned by the driver; it resumes
            // them itself.
            if op.op_type == PendingOpType::FullSync {
                continue;
            }
            report.examined += 1;
            match op.op_type {
                PendingOpType::CreateIssue => self.recover_create(&op, &mut report).await?,
                _ => {
                    // Update-shaped ops are idempotent against convergent
                    // state; the next sync pass reapplies whatever is
                    // still missing.
                    self.store
                        .mark_pending_op_failed(
                            op.id,
                            Some(serde_json::json!({"recovery": "abandoned, next sync reapplies"})),
                        )
                        .await
                        .map_err(store_err)?;
                    report.abandoned += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                linked = report.linked,
                already_applied = report.already_applied,
                abandoned = report.abandoned,
                "pending op recovery completed"
            );
        }
        Ok(report)
    }

    /// Scenario: the process crashed after the tracker journal append but
    /// before the mapping write. The entity may or may not exist upstream.
    async fn recover_create(
        &self,
        op: &PendingOp,
        report: &mut RecoveryReport,
    ) -> Result<(), SyncError> {
        let Some(identifier) = op.payload["identifier"].as_str() else {
            warn!(op = %op.id, "create op without identifier, abandoning");
            self.store
                .mark_pending_op_failed(op.id, None)
                .await
                .map_err(store_err)?;
            report.abandoned += 1;
            return Ok(());
        };

        // The mapping write may actually have landed.
        if let Some(row) = self.store.get_issue(identifier).await.map_err(store_err)? {
            if row.tracker_id.is_some() {
                self.store
                    .mark_pending_op_succeeded(
                        op.id,
                        Some(serde_json::json!({"recovery": "mapping already present"})),
                    )
                    .await
                    .map_err(store_err)?;
                report.already_applied += 1;
                return Ok(());
            }
        }

        // Search the tracker by the PM link label. Found: link it instead
        // of creating a second entry.
        let link = pm_link_label(identifier);
        let upstream = self.tracker.list_issues().await?;
        if let Some(found) = upstream.into_iter().find(|i| i.labels.contains(&link)) {
            let mut row = match self.store.get_issue(identifier).await.map_err(store_err)? {
                Some(row) => row,
                None => {
                    let project = op.payload["project"].as_str().unwrap_or_default();
                    let mut row = vs_core::types::Issue::new(identifier, project);
                    row.title = op.payload["title"].as_str().unwrap_or_default().to_string();
                    row.rehash();
                    row
                }
            };
            row.tracker_id = Some(found.id.clone());
            row.tracker_status = Some(found.status.clone());
            row.tracker_modified_at = found.updated_at_millis();
            self.store.upsert_issue(&row).await.map_err(store_err)?;
            self.store
                .mark_pending_op_succeeded(
                    op.id,
                    Some(serde_json::json!({"recovery": "linked", "tracker_id": found.id})),
                )
                .await
                .map_err(store_err)?;
            info!(issue = identifier, tracker_id = %row.tracker_id.as_deref().unwrap_or(""),
                "recovered crashed create by linking existing tracker issue");
            report.linked += 1;
            return Ok(());
        }

        // No trace upstream: the create never happened. The next sync pass
        // recreates it from the PM side.
        self.store
            .mark_pending_op_failed(
                op.id,
                Some(serde_json::json!({"recovery": "no upstream entity found"})),
            )
            .await
            .map_err(store_err)?;
        report.abandoned += 1;
        Ok(())
    }
}

fn store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "recovery", e.to_string()).with_source(e)
}
