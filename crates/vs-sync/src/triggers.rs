//! Change-driven triggers.
//!
//! The periodic scheduler, the PM webhook, and the filesystem watcher all
//! collapse into one entry point: a single-flight map keyed by project.
//! A trigger that lands while a run is in flight sets a rerun flag; when
//! the run completes, exactly one follow-up starts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vs_core::config::SyncSettings;
use vs_core::error::SyncError;
use vs_core::types::{stable_hash, PendingOpType, ProjectFile, SyncRunCounts, System};
use vs_runtime::{ActivityContext, ActivityOutcome, ActivityRunner};
use vs_store::MappingStore;

use crate::orchestrator::{FetchPlan, SyncOrchestrator};

// ---------------------------------------------------------------------------
// ProjectSyncer
// ---------------------------------------------------------------------------

/// The narrow surface the trigger hub needs; tests stub it.
#[async_trait]
pub trait ProjectSyncer: Send + Sync + 'static {
    async fn sync_project(
        &self,
        project: &str,
        plan: FetchPlan,
    ) -> Result<SyncRunCounts, SyncError>;
}

#[async_trait]
impl ProjectSyncer for SyncOrchestrator {
    async fn sync_project(
        &self,
        project: &str,
        plan: FetchPlan,
    ) -> Result<SyncRunCounts, SyncError> {
        SyncOrchestrator::sync_project(self, project, plan).await
    }
}

// ---------------------------------------------------------------------------
// TriggerHub
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FlightState {
    running: bool,
    rerun: bool,
    /// The collapsed follow-up: full when any queued trigger was full.
    rerun_full: bool,
    rerun_targets: Vec<String>,
}

pub struct TriggerHub {
    syncer: Arc<dyn ProjectSyncer>,
    flights: Arc<DashMap<String, FlightState>>,
}

impl TriggerHub {
    pub fn new(syncer: Arc<dyn ProjectSyncer>) -> Arc<Self> {
        Arc::new(Self {
            syncer,
            flights: Arc::new(DashMap::new()),
        })
    }

    /// Request a sync for a project. `targets` limits the run to the
    /// listed issues (webhook case); `None` is a full incremental pass.
    ///
    /// Returns immediately; the run happens on a spawned task.
    pub fn trigger(&self, project: &str, targets: Option<Vec<String>>) {
        {
            let mut state = self.flights.entry(project.to_string()).or_default();
            if state.running {
                state.rerun = true;
                match &targets {
                    None => state.rerun_full = true,
                    Some(ids) => state.rerun_targets.extend(ids.iter().cloned()),
                }
                debug!(project, "run in flight, rerun queued");
                return;
            }
            state.running = true;
        }

        tokio::spawn(run_until_settled(
            self.syncer.clone(),
            self.flights.clone(),
            project.to_string(),
            targets,
        ));
    }

    /// True when a run is currently in flight for the project.
    pub fn in_flight(&self, project: &str) -> bool {
        self.flights
            .get(project)
            .map(|s| s.running)
            .unwrap_or(false)
    }
}

async fn run_until_settled(
    syncer: Arc<dyn ProjectSyncer>,
    flights: Arc<DashMap<String, FlightState>>,
    project: String,
    mut targets: Option<Vec<String>>,
) {
    loop {
        let plan = match targets.take() {
            Some(ids) if !ids.is_empty() => FetchPlan::Targeted(ids),
            _ => FetchPlan::Incremental,
        };
        if let Err(e) = syncer.sync_project(&project, plan).await {
            warn!(project = %project, error = %e, "sync run failed");
        }

        let next = {
            let mut state = match flights.get_mut(&project) {
                Some(state) => state,
                None => break,
            };
            if state.rerun {
                state.rerun = false;
                let full = std::mem::take(&mut state.rerun_full);
                let queued = std::mem::take(&mut state.rerun_targets);
                Some(if full { None } else { Some(queued) })
            } else {
                state.running = false;
                None
            }
        };

        match next {
            Some(next_targets) => {
                targets = next_targets;
            }
            None => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Body of the PM's issue-changed webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub project: String,
    #[serde(rename = "changedIssues", default)]
    pub changed_issues: Vec<String>,
}

/// Fold a webhook delivery into a targeted run.
pub fn handle_webhook(hub: &Arc<TriggerHub>, event: WebhookEvent) {
    info!(
        project = %event.project,
        issues = event.changed_issues.len(),
        "webhook received"
    );
    let targets = if event.changed_issues.is_empty() {
        None
    } else {
        Some(event.changed_issues)
    };
    hub.trigger(&event.project, targets);
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    hub: Arc<TriggerHub>,
    store: Arc<MappingStore>,
    settings: SyncSettings,
}

impl Scheduler {
    pub fn new(hub: Arc<TriggerHub>, store: Arc<MappingStore>, settings: SyncSettings) -> Self {
        Self {
            hub,
            store,
            settings,
        }
    }

    /// Periodic tick loop; exits when the shutdown flag flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.settings.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.settings.tick_interval_ms,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick_once().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Select and trigger the projects due for a pass: active (nonzero
    /// issue count), never-hashed metadata, or a stale cache.
    pub async fn tick_once(&self) -> Result<usize, SyncError> {
        let projects = self.store.list_projects().await.map_err(|e| {
            SyncError::permanent("store", "scheduler", e.to_string()).with_source(e)
        })?;
        let now = Utc::now().timestamp_millis();
        let full_interval_ms = self.settings.full_interval_ms as i64;

        let mut triggered = 0;
        for project in projects {
            if project.archived {
                continue;
            }
            let count = self
                .store
                .count_issues(&project.identifier)
                .await
                .map_err(|e| {
                    SyncError::permanent("store", "scheduler", e.to_string()).with_source(e)
                })?;
            let cache_expired = match project.last_sync_at {
                None => true,
                Some(at) => now - at > full_interval_ms,
            };
            let metadata_unhashed = project.metadata_hash.is_none();

            if count > 0 || metadata_unhashed || cache_expired {
                self.hub.trigger(&project.identifier, None);
                triggered += 1;
            }
        }
        Ok(triggered)
    }
}

// ---------------------------------------------------------------------------
// File events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    AddOrChange,
    Unlink,
}

/// Applies debounced watcher events to the project-file cache via durable
/// activities.
pub struct FileSyncer {
    store: Arc<MappingStore>,
    runner: Arc<ActivityRunner>,
}

impl FileSyncer {
    pub fn new(store: Arc<MappingStore>, runner: Arc<ActivityRunner>) -> Self {
        Self { store, runner }
    }

    pub async fn handle_event(
        &self,
        project: &str,
        fs_root: &std::path::Path,
        rel_path: &str,
        kind: FileEventKind,
    ) -> Result<(), SyncError> {
        match kind {
            FileEventKind::AddOrChange => self.sync_file(project, fs_root, rel_path).await,
            FileEventKind::Unlink => self.delete_file(project, rel_path).await,
        }
    }

    async fn sync_file(
        &self,
        project: &str,
        fs_root: &std::path::Path,
        rel_path: &str,
    ) -> Result<(), SyncError> {
        let ctx = ActivityContext::mutating(
            "sync-project-file",
            PendingOpType::SyncFiles,
            System::Agents,
            serde_json::json!({"project": project, "path": rel_path}),
        )
        .with_project(project);

        let store = self.store.clone();
        let project = project.to_string();
        let rel_path = rel_path.to_string();
        let abs_path = fs_root.join(&rel_path);

        self.runner
            .run(ctx, move |_attempt| {
                let store = store.clone();
                let project = project.clone();
                let rel_path = rel_path.clone();
                let abs_path = abs_path.clone();
                async move {
                    let bytes = tokio::fs::read(&abs_path).await.map_err(|e| {
                        SyncError::transient(
                            "agents",
                            "sync_file",
                            format!("cannot read {}: {e}", abs_path.display()),
                        )
                    })?;
                    let hash = stable_hash(&[&String::from_utf8_lossy(&bytes)]);

                    let previous = store
                        .project_file(&project, &rel_path)
                        .await
                        .map_err(file_store_err)?;
                    if previous.as_ref().map(|f| f.content_hash.as_str()) == Some(hash.as_str()) {
                        return Ok(ActivityOutcome::skipped(Some(rel_path)));
                    }

                    store
                        .upsert_project_file(&ProjectFile {
                            project: project.clone(),
                            rel_path: rel_path.clone(),
                            content_hash: hash,
                            // A changed file needs re-upload; dropping the
                            // remote id marks it dirty for the memory pass.
                            remote_file_id: None,
                            size: bytes.len() as i64,
                        })
                        .await
                        .map_err(file_store_err)?;
                    Ok(ActivityOutcome::updated(rel_path))
                }
            })
            .await?;
        Ok(())
    }

    async fn delete_file(&self, project: &str, rel_path: &str) -> Result<(), SyncError> {
        let ctx = ActivityContext::mutating(
            "delete-project-file",
            PendingOpType::SyncFiles,
            System::Agents,
            serde_json::json!({"project": project, "path": rel_path}),
        )
        .with_project(project);

        let store = self.store.clone();
        let project = project.to_string();
        let rel_path = rel_path.to_string();

        self.runner
            .run(ctx, move |_attempt| {
                let store = store.clone();
                let project = project.clone();
                let rel_path = rel_path.clone();
                async move {
                    let removed = store
                        .delete_project_file(&project, &rel_path)
                        .await
                        .map_err(file_store_err)?;
                    if removed {
                        Ok(ActivityOutcome::updated(rel_path))
                    } else {
                        Ok(ActivityOutcome::skipped(Some(rel_path)))
                    }
                }
            })
            .await?;
        Ok(())
    }
}

fn file_store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "project_file", e.to_string()).with_source(e)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Syncer that records invocations and can be made slow.
    struct CountingSyncer {
        runs: AtomicUsize,
        delay: Duration,
        plans: Mutex<Vec<String>>,
        gate: tokio::sync::Semaphore,
    }

    impl CountingSyncer {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                delay,
                plans: Mutex::new(Vec::new()),
                gate: tokio::sync::Semaphore::new(1),
            })
        }
    }

    #[async_trait]
    impl ProjectSyncer for CountingSyncer {
        async fn sync_project(
            &self,
            _project: &str,
            plan: FetchPlan,
        ) -> Result<SyncRunCounts, SyncError> {
            // At most one concurrent run must reach us per project; the
            // semaphore would simply queue if the hub misbehaved, but the
            // available_permits check below catches overlap.
            let permit = self.gate.try_acquire().expect("overlapping run detected");
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.plans.lock().unwrap().push(match &plan {
                FetchPlan::Incremental => "incremental".to_string(),
                FetchPlan::Targeted(ids) => format!("targeted:{}", ids.len()),
                FetchPlan::Prefetched(_) => "prefetched".to_string(),
            });
            tokio::time::sleep(self.delay).await;
            drop(permit);
            Ok(SyncRunCounts::default())
        }
    }

    #[tokio::test]
    async fn burst_of_triggers_collapses_to_one_followup() {
        let syncer = CountingSyncer::new(Duration::from_millis(50));
        let hub = TriggerHub::new(syncer.clone());

        hub.trigger("HVSYN", None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Five triggers while the first run is still going.
        for _ in 0..5 {
            hub.trigger("HVSYN", None);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        // One original + exactly one follow-up.
        assert_eq!(syncer.runs.load(Ordering::SeqCst), 2);
        assert!(!hub.in_flight("HVSYN"));
    }

    #[tokio::test]
    async fn queued_targets_merge_into_followup() {
        let syncer = CountingSyncer::new(Duration::from_millis(50));
        let hub = TriggerHub::new(syncer.clone());

        hub.trigger("HVSYN", Some(vec!["HVSYN-1".into()]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.trigger("HVSYN", Some(vec!["HVSYN-2".into()]));
        hub.trigger("HVSYN", Some(vec!["HVSYN-3".into()]));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let plans = syncer.plans.lock().unwrap().clone();
        assert_eq!(plans, vec!["targeted:1", "targeted:2"]);
    }

    #[tokio::test]
    async fn full_trigger_during_targeted_run_escalates_to_full() {
        let syncer = CountingSyncer::new(Duration::from_millis(50));
        let hub = TriggerHub::new(syncer.clone());

        hub.trigger("HVSYN", Some(vec!["HVSYN-1".into()]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.trigger("HVSYN", Some(vec!["HVSYN-2".into()]));
        hub.trigger("HVSYN", None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let plans = syncer.plans.lock().unwrap().clone();
        assert_eq!(plans, vec!["targeted:1", "incremental"]);
    }

    #[tokio::test]
    async fn distinct_projects_run_concurrently() {
        let syncer = CountingSyncer::new(Duration::ZERO);
        let hub = TriggerHub::new(syncer.clone());
        hub.trigger("AAA", None);
        hub.trigger("BBB", None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(syncer.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn webhook_event_deserializes() {
        let body = r#"{"project": "HVSYN", "changedIssues": ["HVSYN-1", "HVSYN-2"]}"#;
        let event: WebhookEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.project, "HVSYN");
        assert_eq!(event.changed_issues.len(), 2);
    }

    #[tokio::test]
    async fn file_syncer_tracks_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MappingStore::open_in_memory().await.unwrap());
        let runner = Arc::new(ActivityRunner::new(
            store.clone(),
            vs_runtime::RetryPolicy::new(2, Duration::from_millis(1)),
        ));
        let syncer = FileSyncer::new(store.clone(), runner);

        tokio::fs::write(dir.path().join("notes.md"), "hello")
            .await
            .unwrap();
        syncer
            .handle_event("HVSYN", dir.path(), "notes.md", FileEventKind::AddOrChange)
            .await
            .unwrap();
        let file = store.project_file("HVSYN", "notes.md").await.unwrap().unwrap();
        assert_eq!(file.size, 5);

        // Unchanged content is a no-op (hash gate).
        syncer
            .handle_event("HVSYN", dir.path(), "notes.md", FileEventKind::AddOrChange)
            .await
            .unwrap();

        syncer
            .handle_event("HVSYN", dir.path(), "notes.md", FileEventKind::Unlink)
            .await
            .unwrap();
        assert!(store.project_file("HVSYN", "notes.md").await.unwrap().is_none());
    }

    /// Gate test helper: the semaphore in CountingSyncer panics the task on
    /// overlap, which `burst_of_triggers_collapses_to_one_followup` would
    /// surface as a hung flight; this test drives the same path directly.
    #[tokio::test]
    async fn single_flight_never_overlaps() {
        let syncer = CountingSyncer::new(Duration::from_millis(30));
        let hub = TriggerHub::new(syncer.clone());
        for _ in 0..20 {
            hub.trigger("HVSYN", None);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(syncer.runs.load(Ordering::SeqCst) >= 1);
        assert!(!hub.in_flight("HVSYN"));
    }
}
