//! On-demand full-sync driver.
//!
//! Fetches every PM project, bulk-fetches their issues in bounded chunks,
//! and fans out per-project orchestration with bounded concurrency. A
//! pending-op record carries the set of completed projects, checkpointed
//! every N, so a crashed run resumes where it left off instead of
//! repeating finished projects.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vs_clients::pm::BulkIssuesRequest;
use vs_clients::traits::PmApi;
use vs_core::config::Config;
use vs_core::error::SyncError;
use vs_core::types::{
    stable_hash, PendingOp, PendingOpType, Project, SyncRunCounts, System,
};
use vs_store::MappingStore;

use crate::orchestrator::{FetchPlan, SyncOrchestrator};

/// Project chunk ceiling for one bulk fetch call.
const PROJECT_CHUNK: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullSyncReport {
    pub projects_total: usize,
    pub projects_completed: usize,
    pub projects_resumed: usize,
    pub projects_failed: usize,
    pub counts: SyncRunCounts,
}

pub struct FullSyncDriver {
    store: Arc<MappingStore>,
    pm: Arc<dyn PmApi>,
    orchestrator: Arc<SyncOrchestrator>,
    config: Arc<Config>,
}

impl FullSyncDriver {
    pub fn new(
        store: Arc<MappingStore>,
        pm: Arc<dyn PmApi>,
        orchestrator: Arc<SyncOrchestrator>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            pm,
            orchestrator,
            config,
        }
    }

    pub async fn run(&self) -> Result<FullSyncReport, SyncError> {
        // 1. All PM projects; unreachable PM aborts the whole drive.
        let pm_projects = self.pm.list_projects().await?;

        // 2. Resolve targets into project rows, refreshing metadata hashes.
        for pm_project in &pm_projects {
            let mut row = self
                .store
                .get_project(&pm_project.identifier)
                .await
                .map_err(store_err)?
                .unwrap_or_else(|| Project::new(&pm_project.identifier, &pm_project.name));
            row.name = pm_project.name.clone();
            row.archived = pm_project.archived;
            row.metadata_hash = Some(stable_hash(&[
                &pm_project.name,
                pm_project.description.as_deref().unwrap_or(""),
                if pm_project.archived { "1" } else { "0" },
            ]));
            self.store.upsert_project(&row).await.map_err(store_err)?;
        }

        let targets: Vec<String> = pm_projects
            .iter()
            .filter(|p| !p.archived)
            .map(|p| p.identifier.clone())
            .collect();

        // 3. Resume state: an unresolved full-sync op carries the projects
        // already done within the interrupted run.
        let (checkpoint_op, mut completed) = self.load_or_create_checkpoint().await?;
        let resumed = completed.len();
        if resumed > 0 {
            info!(resumed, "resuming full sync from checkpoint");
        }

        let mut report = FullSyncReport {
            projects_total: targets.len(),
            projects_resumed: resumed,
            ..Default::default()
        };

        let checkpoint_every = self.config.sync.checkpoint_every.max(1);
        let max_workers = if self.config.sync.parallel {
            self.config.sync.max_workers.max(1)
        } else {
            1
        };

        // 4. Chunked bulk fetch + bounded fan-out.
        let pending: Vec<String> = targets
            .iter()
            .filter(|t| !completed.contains(*t))
            .cloned()
            .collect();

        let mut since_checkpoint = 0usize;
        for chunk in pending.chunks(PROJECT_CHUNK) {
            let req = BulkIssuesRequest {
                projects: chunk.to_vec(),
                include_descriptions: Some(true),
                ..Default::default()
            };
            let mut bulk = self.pm.list_issues_bulk(&req).await?;
            for missing in &bulk.not_found {
                warn!(project = %missing, "PM reported project missing during full sync");
            }

            let jobs = chunk.iter().map(|project_id| {
                let issues = bulk
                    .projects
                    .remove(project_id)
                    .map(|p| p.issues)
                    .unwrap_or_default();
                let orchestrator = self.orchestrator.clone();
                let project_id = project_id.clone();
                async move {
                    let result = orchestrator
                        .sync_project(&project_id, FetchPlan::Prefetched(issues))
                        .await;
                    (project_id, result)
                }
            });

            let results: Vec<(String, Result<SyncRunCounts, SyncError>)> =
                stream::iter(jobs).buffer_unordered(max_workers).collect().await;

            for (project_id, result) in results {
                match result {
                    Ok(counts) => {
                        report.projects_completed += 1;
                        report.counts.merge(&counts);
                        completed.insert(project_id);
                        since_checkpoint += 1;
                    }
                    Err(e) => {
                        report.projects_failed += 1;
                        warn!(project = %project_id, error = %e, "project failed during full sync");
                    }
                }
                if since_checkpoint >= checkpoint_every {
                    self.write_checkpoint(&checkpoint_op, &completed).await?;
                    since_checkpoint = 0;
                }
            }
        }

        // 5. Close the checkpoint; the next full sync starts clean.
        self.store
            .mark_pending_op_succeeded(
                checkpoint_op.id,
                Some(serde_json::json!({
                    "completed": report.projects_completed,
                    "failed": report.projects_failed,
                })),
            )
            .await
            .map_err(store_err)?;

        info!(
            total = report.projects_total,
            completed = report.projects_completed,
            failed = report.projects_failed,
            "full sync finished"
        );
        Ok(report)
    }

    async fn load_or_create_checkpoint(
        &self,
    ) -> Result<(PendingOp, HashSet<String>), SyncError> {
        let unresolved = self
            .store
            .list_unresolved_pending_ops()
            .await
            .map_err(store_err)?;
        if let Some(op) = unresolved
            .into_iter()
            .find(|op| op.op_type == PendingOpType::FullSync)
        {
            let completed: HashSet<String> = op.payload["completed_projects"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            return Ok((op, completed));
        }

        let op = PendingOp::new(
            PendingOpType::FullSync,
            System::Pm,
            serde_json::json!({"completed_projects": []}),
        );
        self.store.create_pending_op(&op).await.map_err(store_err)?;
        Ok((op, HashSet::new()))
    }

    async fn write_checkpoint(
        &self,
        op: &PendingOp,
        completed: &HashSet<String>,
    ) -> Result<(), SyncError> {
        let mut sorted: Vec<&String> = completed.iter().collect();
        sorted.sort();
        self.store
            .update_pending_op_payload(op.id, serde_json::json!({ "completed_projects": sorted }))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "full_sync", e.to_string()).with_source(e)
}
