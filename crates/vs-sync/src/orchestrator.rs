//! The per-project sync orchestrator.
//!
//! A run moves through four phases in strict order: prepare, PM → others,
//! Tracker → PM, agent notification. The orchestrator holds no durable
//! state of its own; every decision reads the mapping store and every
//! effect goes through a durably retried activity. Overlapping runs for
//! the same project are impossible: a per-project mutex serialises entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vs_clients::pm::{BulkIssuesRequest, BulkUpdateItem, PmIssue, PmIssuePatch};
use vs_clients::tracker::{NewTrackerIssue, TrackerUpdate};
use vs_clients::traits::{PmApi, TrackerApi};
use vs_core::config::Config;
use vs_core::error::{ErrorClass, SyncError};
use vs_core::status::{
    canonical_from_pm, canonical_from_tracker, identifier_from_labels, pm_from_canonical,
    pm_link_label, tracker_from_canonical, HOST_LABEL_PREFIX,
};
use vs_core::types::{
    CanonicalStatus, Issue, PendingOpType, Priority, Project, SyncRun, SyncRunCounts,
    SyncRunError, System,
};
use vs_runtime::{ActivityContext, ActivityOutcome, ActivityRunner};
use vs_store::MappingStore;

use crate::dedup::DedupCache;
use crate::provisioner::AgentProvisioner;

/// PM bulk-update chunk ceiling.
const BULK_PATCH_CHUNK: usize = 25;

/// Key prefix for rows first observed on the Tracker side, before any PM
/// identifier exists for them.
const SYNTHETIC_PREFIX: &str = "trk-";

// ---------------------------------------------------------------------------
// FetchPlan
// ---------------------------------------------------------------------------

/// How Phase 1 obtains the PM's view of the project.
#[derive(Debug, Clone)]
pub enum FetchPlan {
    /// Bulk fetch everything modified since the stored high-water mark.
    Incremental,
    /// Webhook-driven: re-fetch only the listed issues.
    Targeted(Vec<String>),
    /// Full-sync driver already fetched this project's issues.
    Prefetched(Vec<PmIssue>),
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    store: Arc<MappingStore>,
    pm: Arc<dyn PmApi>,
    tracker: Arc<dyn TrackerApi>,
    provisioner: Option<Arc<AgentProvisioner>>,
    runner: Arc<ActivityRunner>,
    dedup: Arc<DedupCache>,
    config: Arc<Config>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<MappingStore>,
        pm: Arc<dyn PmApi>,
        tracker: Arc<dyn TrackerApi>,
        provisioner: Option<Arc<AgentProvisioner>>,
        runner: Arc<ActivityRunner>,
        dedup: Arc<DedupCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            pm,
            tracker,
            provisioner,
            runner,
            dedup,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    /// Run one sync pass for a project.
    ///
    /// Returns the run's counters on any completion, including partial ones
    /// where individual issues failed. `Err` means the run aborted at the
    /// phase level (fetch failure, store failure, deadline); the lock is
    /// released either way and the next trigger retries.
    pub async fn sync_project(
        &self,
        project_id: &str,
        plan: FetchPlan,
    ) -> Result<SyncRunCounts, SyncError> {
        let lock = self
            .locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // --- Phase 0: prepare -------------------------------------------------
        let deadline = Instant::now() + self.config.cycle_deadline();
        let run_start_ms = Utc::now().timestamp_millis();

        let mut project = match self.store.get_project(project_id).await.map_err(store_err)? {
            Some(p) => p,
            None => {
                let p = Project::new(project_id, project_id);
                self.store.upsert_project(&p).await.map_err(store_err)?;
                p
            }
        };

        let run = self
            .store
            .start_sync_run(Some(project_id))
            .await
            .map_err(store_err)?;
        let mut counts = SyncRunCounts::default();

        self.dedup.get(project_id).await?;

        // --- Phase 1: PM -> others -------------------------------------------
        let targeted = matches!(plan, FetchPlan::Targeted(_));
        let pm_issues = match self.fetch_pm_issues(project_id, plan, &run, &mut counts).await {
            Ok(issues) => issues,
            Err(e) => {
                self.abort_run(&run, counts, &e).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .phase1(project_id, &pm_issues, run_start_ms, &run, &mut counts)
            .await
        {
            self.abort_run(&run, counts, &e).await;
            return Err(e);
        }

        if self.deadline_hit(deadline, &run, &mut counts).await {
            return Ok(counts);
        }

        // --- Phase 2: Tracker -> PM -------------------------------------------
        // Targeted runs reconcile only the listed issues; the periodic pass
        // picks up tracker-side edits.
        if !targeted {
            if let Err(e) = self.phase2(project_id, run_start_ms, &run, &mut counts).await {
                self.abort_run(&run, counts, &e).await;
                return Err(e);
            }
        }

        if self.deadline_hit(deadline, &run, &mut counts).await {
            return Ok(counts);
        }

        // --- Phase 3: notify agent ---------------------------------------------
        // Secondary by design: failures log and never fail the sync.
        if counts.created + counts.updated > 0 {
            if let (Some(provisioner), Some(agent_id)) =
                (&self.provisioner, project.agent_id.clone())
            {
                let snapshot = self
                    .store
                    .project_issues(project_id)
                    .await
                    .map_err(store_err)?;
                let blocks = crate::provisioner::build_memory_blocks(&project, &snapshot);
                if let Err(e) = provisioner.update_memory_blocks(&agent_id, blocks).await {
                    warn!(project = project_id, error = %e, "agent memory update failed, continuing");
                }
            }
        }

        // --- Complete ----------------------------------------------------------
        project.last_sync_at = Some(Utc::now().timestamp_millis());
        self.store.upsert_project(&project).await.map_err(store_err)?;
        self.store
            .complete_sync_run(run.id, counts)
            .await
            .map_err(store_err)?;

        info!(
            project = project_id,
            created = counts.created,
            updated = counts.updated,
            skipped = counts.skipped,
            failed = counts.failed,
            "sync run completed"
        );
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Phase 1
    // -----------------------------------------------------------------------

    async fn fetch_pm_issues(
        &self,
        project_id: &str,
        plan: FetchPlan,
        run: &SyncRun,
        counts: &mut SyncRunCounts,
    ) -> Result<Vec<PmIssue>, SyncError> {
        match plan {
            FetchPlan::Prefetched(issues) => Ok(issues),
            FetchPlan::Incremental => {
                let modified_since = self
                    .store
                    .max_pm_modified_at(project_id)
                    .await
                    .map_err(store_err)?;
                let req = BulkIssuesRequest {
                    projects: vec![project_id.to_string()],
                    modified_since,
                    include_descriptions: Some(true),
                    ..Default::default()
                };
                let mut resp = self.pm.list_issues_bulk(&req).await?;
                Ok(resp
                    .projects
                    .remove(project_id)
                    .map(|p| p.issues)
                    .unwrap_or_default())
            }
            FetchPlan::Targeted(identifiers) => {
                let mut issues = Vec::with_capacity(identifiers.len());
                for identifier in identifiers {
                    match self.pm.get_issue(&identifier).await? {
                        Some(issue) => issues.push(issue),
                        None => {
                            // Explicit recheck said 404: mark, retain.
                            if self
                                .store
                                .get_issue(&identifier)
                                .await
                                .map_err(store_err)?
                                .is_some()
                            {
                                self.store
                                    .mark_issue_removed(&identifier, System::Pm)
                                    .await
                                    .map_err(store_err)?;
                                self.record_issue_error(
                                    run,
                                    project_id,
                                    &identifier,
                                    "recheck",
                                    "issue no longer present in PM, marked removed",
                                )
                                .await;
                                counts.skipped += 1;
                            }
                        }
                    }
                }
                Ok(issues)
            }
        }
    }

    async fn phase1(
        &self,
        project_id: &str,
        pm_issues: &[PmIssue],
        run_start_ms: i64,
        run: &SyncRun,
        counts: &mut SyncRunCounts,
    ) -> Result<(), SyncError> {
        let mut rows_to_write: Vec<Issue> = Vec::new();

        for pm_issue in pm_issues {
            let index = self.dedup.get(project_id).await?;

            // 1. Locate: canonical identifier, then foreign id, then title.
            let existing = match self.store.get_issue(&pm_issue.identifier).await.map_err(store_err)? {
                Some(row) => Some(row),
                None => index
                    .by_foreign_id(System::Pm, pm_issue.identifier.as_str())
                    .or_else(|| index.by_title(&pm_issue.title))
                    .cloned(),
            };

            match existing {
                None => {
                    match self
                        .create_in_tracker(project_id, pm_issue, run_start_ms)
                        .await?
                    {
                        Ok((row, was_created)) => {
                            if was_created {
                                counts.created += 1;
                            } else {
                                counts.skipped += 1;
                            }
                            rows_to_write.push(row);
                        }
                        Err(outcome) => {
                            counts.failed += 1;
                            self.record_issue_error(
                                run,
                                project_id,
                                &pm_issue.identifier,
                                "create_in_tracker",
                                outcome.error.as_deref().unwrap_or("unknown"),
                            )
                            .await;
                        }
                    }
                }
                Some(row) => {
                    let changed = self
                        .apply_pm_update(project_id, pm_issue, row, run_start_ms, run, counts)
                        .await?;
                    if let Some(row) = changed {
                        rows_to_write.push(row);
                    }
                }
            }
        }

        // 5. One transaction for the whole phase. Any write invalidates
        // the project's dedup snapshot so Phase 2 sees this phase's state.
        let wrote = !rows_to_write.is_empty();
        self.store
            .batch_upsert_issues(rows_to_write)
            .await
            .map_err(store_err)?;
        if wrote {
            self.dedup.invalidate(project_id);
        }
        Ok(())
    }

    /// Create the tracker counterpart for a PM issue nobody has seen
    /// before, returning the new mapping row and whether a remote create
    /// actually happened. `Err(outcome)` carries the failed activity
    /// result.
    async fn create_in_tracker(
        &self,
        project_id: &str,
        pm_issue: &PmIssue,
        run_start_ms: i64,
    ) -> Result<Result<(Issue, bool), ActivityOutcome>, SyncError> {
        let status = canonical_from_pm(&pm_issue.status).unwrap_or(CanonicalStatus::Backlog);
        let priority = pm_issue
            .priority
            .as_deref()
            .map(Priority::from_name)
            .unwrap_or_default();
        let encoding = tracker_from_canonical(status);

        let ctx = ActivityContext::mutating(
            "create-in-tracker",
            PendingOpType::CreateIssue,
            System::Tracker,
            serde_json::json!({
                "project": project_id,
                "identifier": pm_issue.identifier,
                "title": pm_issue.title,
            }),
        )
        .with_project(project_id)
        .with_identifier(pm_issue.identifier.clone());

        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let identifier = pm_issue.identifier.clone();
        let mut labels = vec![pm_link_label(&identifier)];
        if let Some(host) = &encoding.host_label {
            labels.push(host.clone());
        }
        let new_issue = NewTrackerIssue {
            title: pm_issue.title.clone(),
            description: pm_issue.description.clone(),
            status: encoding.status.to_string(),
            priority: priority.to_tracker(),
            issue_type: "task".to_string(),
            labels,
        };

        let outcome = self
            .runner
            .run(ctx, move |_attempt| {
                let store = store.clone();
                let tracker = tracker.clone();
                let identifier = identifier.clone();
                let new_issue = new_issue.clone();
                async move {
                    // Idempotence: a retry after a partial success finds the
                    // link already persisted and skips.
                    if let Some(row) = store.get_issue(&identifier).await.map_err(store_err)? {
                        if let Some(tracker_id) = row.tracker_id {
                            return Ok(ActivityOutcome::skipped(Some(tracker_id)));
                        }
                    }
                    let created = tracker.create_issue(&new_issue).await?;
                    Ok(ActivityOutcome::created(created.id))
                }
            })
            .await?;

        if !outcome.success {
            return Ok(Err(outcome));
        }

        let mut row = Issue::new(&pm_issue.identifier, project_id);
        row.title = pm_issue.title.clone();
        row.description = pm_issue.description.clone().unwrap_or_default();
        row.status = status;
        row.priority = priority;
        row.pm_id = Some(pm_issue.identifier.clone());
        row.tracker_id = outcome.id.clone();
        row.pm_modified_at = Some(pm_issue.modified_on);
        // The tracker entity was written by us just now; stamping the run
        // start keeps Phase 2 from echoing it back.
        row.tracker_modified_at = Some(run_start_ms);
        row.pm_status = Some(pm_issue.status.clone());
        row.tracker_status = Some(encoding.status.to_string());
        row.parent = pm_issue.parent_identifier.clone();
        row.subissue_count = pm_issue.sub_issue_count;
        row.last_sync_at = Some(run_start_ms);
        row.rehash();
        Ok(Ok((row, outcome.created)))
    }

    /// Fold a PM-side update into an existing row, pushing disagreements to
    /// the tracker. Returns the row when it changed and needs persisting.
    async fn apply_pm_update(
        &self,
        project_id: &str,
        pm_issue: &PmIssue,
        row: Issue,
        run_start_ms: i64,
        run: &SyncRun,
        counts: &mut SyncRunCounts,
    ) -> Result<Option<Issue>, SyncError> {
        let original = row.clone();
        let mut row = row;

        // A dedup hit under a synthetic key adopts the PM identifier as its
        // canonical identity.
        if row.identifier != pm_issue.identifier {
            debug!(
                old = %row.identifier,
                new = %pm_issue.identifier,
                "linking synthetic row to PM identifier"
            );
            self.store
                .delete_issue(&row.identifier)
                .await
                .map_err(store_err)?;
            row.identifier = pm_issue.identifier.clone();
        }
        row.pm_id = Some(pm_issue.identifier.clone());

        let stored_pm_mod = original.pm_modified_at.unwrap_or(0);
        if pm_issue.modified_on > stored_pm_mod {
            let status = canonical_from_pm(&pm_issue.status).unwrap_or(row.status);
            let priority = pm_issue
                .priority
                .as_deref()
                .map(Priority::from_name)
                .unwrap_or(row.priority);
            let description = pm_issue.description.clone().unwrap_or_default();

            // 3. Targeted update to the tracker when its stored view
            // disagrees with the canonical mapping of the PM value.
            if let Some(tracker_id) = row.tracker_id.clone() {
                let disagrees = status != row.status
                    || pm_issue.title != row.title
                    || description != row.description
                    || priority != row.priority;
                if disagrees {
                    let outcome = self
                        .update_tracker_issue(
                            project_id,
                            &row.identifier,
                            &tracker_id,
                            pm_issue,
                            status,
                            priority,
                        )
                        .await?;
                    if outcome.success {
                        counts.updated += 1;
                        row.tracker_status =
                            Some(tracker_from_canonical(status).status.to_string());
                        row.tracker_modified_at = Some(run_start_ms);
                    } else {
                        counts.failed += 1;
                        self.record_issue_error(
                            run,
                            project_id,
                            &row.identifier,
                            "update_tracker",
                            outcome.error.as_deref().unwrap_or("unknown"),
                        )
                        .await;
                    }
                }
            }

            // 4. Fold the PM state into the row.
            row.title = pm_issue.title.clone();
            row.description = description;
            row.status = status;
            row.priority = priority;
            row.pm_modified_at = Some(pm_issue.modified_on);
            row.pm_status = Some(pm_issue.status.clone());
            row.parent = pm_issue.parent_identifier.clone();
            row.subissue_count = pm_issue.sub_issue_count;
            row.removed_from_pm = false;
            row.rehash();
        }

        if row == original {
            counts.skipped += 1;
            return Ok(None);
        }
        row.last_sync_at = Some(run_start_ms);
        Ok(Some(row))
    }

    async fn update_tracker_issue(
        &self,
        project_id: &str,
        identifier: &str,
        tracker_id: &str,
        pm_issue: &PmIssue,
        status: CanonicalStatus,
        priority: Priority,
    ) -> Result<ActivityOutcome, SyncError> {
        let ctx = ActivityContext::mutating(
            "update-in-tracker",
            PendingOpType::UpdateIssue,
            System::Tracker,
            serde_json::json!({
                "project": project_id,
                "identifier": identifier,
                "tracker_id": tracker_id,
            }),
        )
        .with_project(project_id)
        .with_identifier(identifier.to_string());

        let tracker = self.tracker.clone();
        let tracker_id = tracker_id.to_string();
        let encoding = tracker_from_canonical(status);
        let update = TrackerUpdate {
            status: Some(encoding.status.to_string()),
            title: Some(pm_issue.title.clone()),
            description: pm_issue.description.clone(),
            priority: Some(priority.to_tracker()),
        };

        self.runner
            .run(ctx, move |_attempt| {
                let tracker = tracker.clone();
                let tracker_id = tracker_id.clone();
                let update = update.clone();
                let encoding = encoding.clone();
                async move {
                    let Some(current) = tracker.show(&tracker_id).await? else {
                        return Err(SyncError::not_found(
                            "tracker",
                            "update",
                            format!("issue {tracker_id} vanished upstream"),
                        ));
                    };

                    tracker.update_issue(&tracker_id, &update).await?;

                    // Reconcile host labels with the new canonical status.
                    let wanted = encoding.host_label.as_deref();
                    for label in current
                        .labels
                        .iter()
                        .filter(|l| l.starts_with(HOST_LABEL_PREFIX))
                    {
                        if Some(label.as_str()) != wanted {
                            tracker.remove_label(&tracker_id, label).await?;
                        }
                    }
                    if let Some(wanted) = wanted {
                        if !current.labels.iter().any(|l| l == wanted) {
                            tracker.add_label(&tracker_id, wanted).await?;
                        }
                    }
                    Ok(ActivityOutcome::updated(tracker_id))
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Phase 2
    // -----------------------------------------------------------------------

    async fn phase2(
        &self,
        project_id: &str,
        run_start_ms: i64,
        run: &SyncRun,
        counts: &mut SyncRunCounts,
    ) -> Result<(), SyncError> {
        let tracker_issues = self.tracker.list_issues().await?;
        let index = self.dedup.get(project_id).await?;

        let mut rows_to_write: Vec<Issue> = Vec::new();
        // Candidate patches paired with the row state to persist once the
        // PM confirms the write.
        let mut patches: Vec<(BulkUpdateItem, Issue)> = Vec::new();

        for t_issue in &tracker_issues {
            let mapped = index
                .by_foreign_id(System::Tracker, &t_issue.id)
                .cloned()
                .or({
                    match identifier_from_labels(&t_issue.labels) {
                        Some(identifier) => index.by_canonical(identifier).cloned(),
                        None => None,
                    }
                });

            let Some(row) = mapped else {
                // First observation on the tracker side: record under a
                // synthetic key so later PM creations link instead of
                // duplicating. No PM entity is created from this side.
                if identifier_from_labels(&t_issue.labels).is_none() {
                    if let Some(row) = self.adopt_tracker_issue(project_id, t_issue, run_start_ms) {
                        rows_to_write.push(row);
                    }
                }
                continue;
            };
            if row.project != project_id {
                continue;
            }

            let Some(t_mod) = t_issue.updated_at_millis() else {
                continue;
            };
            if t_mod <= row.tracker_modified_at.unwrap_or(0) {
                continue;
            }
            // Anything stamped at or after this run's start is our own
            // Phase 1 write coming back around.
            if t_mod >= run_start_ms {
                continue;
            }

            let mut row_after = row.clone();
            row_after.tracker_modified_at = Some(t_mod);
            row_after.tracker_status = Some(t_issue.status.clone());
            let mut patch = PmIssuePatch::default();

            // Per-field last-write-wins; the PM wins ties. A field the PM
            // touched more recently keeps the PM value (Phase 1 already
            // pushed it to the tracker).
            let pm_mod = row.pm_modified_at.unwrap_or(0);
            let tracker_wins = t_mod > pm_mod;

            let t_status = canonical_from_tracker(&t_issue.status, &t_issue.labels);
            // The tracker's default `open` is never an explicit transition.
            if tracker_wins && t_status != row.status && t_issue.status != "open" {
                patch.status = Some(pm_from_canonical(t_status).to_string());
                row_after.status = t_status;
            }
            if tracker_wins && t_issue.title != row.title {
                patch.title = Some(t_issue.title.clone());
                row_after.title = t_issue.title.clone();
            }
            let t_description = t_issue.description.clone().unwrap_or_default();
            if tracker_wins && !t_description.is_empty() && t_description != row.description {
                patch.description = Some(t_description.clone());
                row_after.description = t_description;
            }

            if patch.is_empty() {
                // Clock moved but nothing to propagate; still persist the
                // new high-water mark.
                if row_after != row {
                    rows_to_write.push(row_after);
                }
                counts.skipped += 1;
                continue;
            }

            // Synthetic rows have no PM counterpart to patch.
            if row.identifier.starts_with(SYNTHETIC_PREFIX) {
                row_after.rehash();
                rows_to_write.push(row_after);
                continue;
            }

            row_after.rehash();
            patches.push((
                BulkUpdateItem {
                    identifier: row.identifier.clone(),
                    changes: patch,
                },
                row_after,
            ));
        }

        // Batch-patch the PM in bounded chunks; per-row failures record and
        // drop only that row's store write.
        for chunk in patches.chunks(BULK_PATCH_CHUNK) {
            let items: Vec<BulkUpdateItem> = chunk.iter().map(|(item, _)| item.clone()).collect();
            let ctx = ActivityContext::mutating(
                "patch-pm-bulk",
                PendingOpType::UpdateIssue,
                System::Pm,
                serde_json::json!({
                    "project": project_id,
                    "identifiers": items.iter().map(|i| i.identifier.clone()).collect::<Vec<_>>(),
                }),
            )
            .with_project(project_id);

            let pm = self.pm.clone();
            let call_items = items.clone();
            let outcome_rows: HashMap<String, &Issue> = chunk
                .iter()
                .map(|(item, row)| (item.identifier.clone(), row))
                .collect();

            let outcome = self
                .runner
                .run(ctx, move |_attempt| {
                    let pm = pm.clone();
                    let items = call_items.clone();
                    async move {
                        let results = pm.bulk_update(&items).await?;
                        let failures: Vec<String> = results
                            .iter()
                            .filter(|r| !r.success)
                            .map(|r| {
                                format!(
                                    "{}: {}",
                                    r.identifier,
                                    r.error.as_deref().unwrap_or("unspecified")
                                )
                            })
                            .collect();
                        let mut out = ActivityOutcome::ok();
                        out.updated = true;
                        if !failures.is_empty() {
                            out.error = Some(failures.join("; "));
                        }
                        Ok(out)
                    }
                })
                .await?;

            if !outcome.success {
                counts.failed += items.len() as u64;
                self.record_issue_error(
                    run,
                    project_id,
                    "",
                    "patch_pm_bulk",
                    outcome.error.as_deref().unwrap_or("unknown"),
                )
                .await;
                continue;
            }

            let failed_rows: Vec<&str> = outcome
                .error
                .as_deref()
                .map(|e| {
                    e.split("; ")
                        .filter_map(|part| part.split(':').next())
                        .collect()
                })
                .unwrap_or_default();
            for (identifier, row) in &outcome_rows {
                if failed_rows.contains(&identifier.as_str()) {
                    counts.failed += 1;
                    self.record_issue_error(
                        run,
                        project_id,
                        identifier,
                        "patch_pm",
                        "bulk update row failed",
                    )
                    .await;
                } else {
                    counts.updated += 1;
                    rows_to_write.push((*row).clone());
                }
            }
        }

        self.store
            .batch_upsert_issues(rows_to_write)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Build a synthetic mapping row for a tracker issue with no PM link.
    fn adopt_tracker_issue(
        &self,
        project_id: &str,
        t_issue: &vs_clients::tracker::TrackerIssue,
        run_start_ms: i64,
    ) -> Option<Issue> {
        let t_mod = t_issue.updated_at_millis()?;
        let mut row = Issue::new(format!("{SYNTHETIC_PREFIX}{}", t_issue.id), project_id);
        row.title = t_issue.title.clone();
        row.description = t_issue.description.clone().unwrap_or_default();
        row.status = canonical_from_tracker(&t_issue.status, &t_issue.labels);
        row.priority = Priority::from_tracker(t_issue.priority);
        row.tracker_id = Some(t_issue.id.clone());
        row.tracker_modified_at = Some(t_mod);
        row.tracker_status = Some(t_issue.status.clone());
        row.last_sync_at = Some(run_start_ms);
        row.rehash();
        Some(row)
    }

    // -----------------------------------------------------------------------
    // Run bookkeeping
    // -----------------------------------------------------------------------

    async fn record_issue_error(
        &self,
        run: &SyncRun,
        project: &str,
        identifier: &str,
        operation: &str,
        message: &str,
    ) {
        let error = SyncRunError {
            run_id: run.id,
            project: Some(project.to_string()),
            identifier: (!identifier.is_empty()).then(|| identifier.to_string()),
            operation: operation.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self.store.record_error(&error).await {
            warn!(error = %e, "could not record sync error");
        }
    }

    async fn abort_run(&self, run: &SyncRun, counts: SyncRunCounts, cause: &SyncError) {
        warn!(run = %run.id, error = %cause, "sync run aborted");
        self.record_issue_error(
            run,
            run.project.as_deref().unwrap_or(""),
            "",
            "abort",
            &cause.to_string(),
        )
        .await;
        if let Err(e) = self.store.complete_sync_run(run.id, counts).await {
            warn!(error = %e, "could not complete aborted sync run");
        }
    }

    /// Deadline check at a phase boundary. On expiry the run record closes
    /// with a timeout error and the caller returns what it has.
    async fn deadline_hit(
        &self,
        deadline: Instant,
        run: &SyncRun,
        counts: &mut SyncRunCounts,
    ) -> bool {
        if Instant::now() < deadline {
            return false;
        }
        counts.failed += 1;
        let timeout = SyncError::new(
            ErrorClass::Unavailable,
            "orchestrator",
            "cycle",
            "sync cycle deadline exceeded",
        );
        self.abort_run(run, *counts, &timeout).await;
        true
    }
}

fn store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "mapping", e.to_string()).with_source(e)
}
