//! Periodic reconciliation sweep.
//!
//! For every project, rows holding a Tracker foreign ID are checked
//! against the tracker's actual contents. Rows whose upstream entity
//! vanished are marked removed (default) or hard-deleted, per the
//! configured action; dry-run mode only reports.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vs_clients::traits::TrackerApi;
use vs_core::config::ReconcileAction;
use vs_core::error::SyncError;
use vs_core::types::System;
use vs_store::MappingStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub projects: usize,
    pub checked: usize,
    pub stale: usize,
    pub marked: usize,
    pub deleted: usize,
}

pub struct Reconciler {
    store: Arc<MappingStore>,
    tracker: Arc<dyn TrackerApi>,
}

impl Reconciler {
    pub fn new(store: Arc<MappingStore>, tracker: Arc<dyn TrackerApi>) -> Self {
        Self { store, tracker }
    }

    /// One full sweep over every project. The action applies per
    /// invocation, so a dry run can precede a destructive pass with the
    /// same instance.
    pub async fn run_sweep(
        &self,
        action: ReconcileAction,
        dry_run: bool,
    ) -> Result<ReconcileReport, SyncError> {
        let upstream: HashSet<String> = self
            .tracker
            .list_issues()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();

        let projects = self.store.list_projects().await.map_err(store_err)?;
        let mut report = ReconcileReport {
            projects: projects.len(),
            ..Default::default()
        };

        for project in &projects {
            let rows = self
                .store
                .issues_with_foreign_id(&project.identifier, System::Tracker)
                .await
                .map_err(store_err)?;

            for row in rows {
                report.checked += 1;
                let Some(tracker_id) = &row.tracker_id else {
                    continue;
                };
                if upstream.contains(tracker_id) {
                    continue;
                }
                report.stale += 1;

                if dry_run {
                    info!(
                        project = %project.identifier,
                        issue = %row.identifier,
                        tracker_id = %tracker_id,
                        "stale tracker reference (dry run, no action)"
                    );
                    continue;
                }

                match action {
                    ReconcileAction::MarkDeleted => {
                        self.store
                            .mark_issue_removed(&row.identifier, System::Tracker)
                            .await
                            .map_err(store_err)?;
                        report.marked += 1;
                        debug!(issue = %row.identifier, "marked removed-from-tracker");
                    }
                    ReconcileAction::HardDelete => {
                        self.store
                            .delete_issue(&row.identifier)
                            .await
                            .map_err(store_err)?;
                        report.deleted += 1;
                        warn!(issue = %row.identifier, "row hard-deleted by reconciler");
                    }
                }
            }
        }

        info!(
            projects = report.projects,
            checked = report.checked,
            stale = report.stale,
            marked = report.marked,
            deleted = report.deleted,
            dry_run,
            "reconciliation sweep completed"
        );
        Ok(report)
    }
}

fn store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "reconcile", e.to_string()).with_source(e)
}
