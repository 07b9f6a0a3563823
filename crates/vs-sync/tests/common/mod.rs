//! In-memory fakes for the three external systems, plus an environment
//! builder wiring them into a real orchestrator over an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use vs_clients::agents::{AgentInfo, MemoryBlock, NewAgent, ToolRef};
use vs_clients::pm::{
    BulkIssuesRequest, BulkIssuesResponse, BulkProjectIssues, BulkUpdateItem, BulkUpdateOutcome,
    NewPmIssue, PmIssue, PmIssuePatch, PmProject,
};
use vs_clients::tracker::{NewTrackerIssue, TrackerIssue, TrackerUpdate};
use vs_clients::traits::{AgentsApi, PmApi, TrackerApi};
use vs_core::config::{
    AgentsConfig, Config, DaemonConfig, HttpConfig, PmConfig, ReconcileConfig, StoreConfig,
    SyncSettings, TrackerConfig,
};
use vs_core::error::SyncError;
use vs_runtime::{ActivityRunner, RetryPolicy};
use vs_store::MappingStore;
use vs_sync::{AgentProvisioner, DedupCache, SyncOrchestrator};

// ---------------------------------------------------------------------------
// FakePm
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakePm {
    pub projects: Mutex<Vec<PmProject>>,
    pub issues: Mutex<HashMap<String, PmIssue>>,
    pub patches: Mutex<Vec<(String, PmIssuePatch)>>,
    pub bulk_update_calls: AtomicUsize,
    pub bulk_fetch_calls: AtomicUsize,
}

impl FakePm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_issue(&self, issue: PmIssue) {
        self.issues
            .lock()
            .unwrap()
            .insert(issue.identifier.clone(), issue);
    }

    pub fn recorded_patches(&self) -> Vec<(String, PmIssuePatch)> {
        self.patches.lock().unwrap().clone()
    }
}

pub fn pm_issue(
    identifier: &str,
    project: &str,
    title: &str,
    description: &str,
    status: &str,
    priority: &str,
    modified_on: i64,
) -> PmIssue {
    PmIssue {
        identifier: identifier.to_string(),
        project_identifier: Some(project.to_string()),
        title: title.to_string(),
        description: Some(description.to_string()),
        status: status.to_string(),
        priority: Some(priority.to_string()),
        modified_on,
        parent_identifier: None,
        sub_issue_count: 0,
    }
}

#[async_trait]
impl PmApi for FakePm {
    async fn list_projects(&self) -> Result<Vec<PmProject>, SyncError> {
        Ok(self.projects.lock().unwrap().clone())
    }

    async fn list_issues_bulk(
        &self,
        req: &BulkIssuesRequest,
    ) -> Result<BulkIssuesResponse, SyncError> {
        self.bulk_fetch_calls.fetch_add(1, Ordering::SeqCst);
        let issues = self.issues.lock().unwrap();
        let mut projects = HashMap::new();
        for project in &req.projects {
            let matched: Vec<PmIssue> = issues
                .values()
                .filter(|i| i.project_identifier.as_deref() == Some(project.as_str()))
                .filter(|i| match req.modified_since {
                    Some(since) => i.modified_on >= since,
                    None => true,
                })
                .cloned()
                .collect();
            let count = matched.len() as i64;
            projects.insert(
                project.clone(),
                BulkProjectIssues {
                    issues: matched,
                    count,
                },
            );
        }
        Ok(BulkIssuesResponse {
            total_issues: projects.values().map(|p| p.count).sum(),
            project_count: projects.len() as i64,
            projects,
            not_found: Vec::new(),
        })
    }

    async fn get_issue(&self, identifier: &str) -> Result<Option<PmIssue>, SyncError> {
        Ok(self.issues.lock().unwrap().get(identifier).cloned())
    }

    async fn create_issue(&self, new: &NewPmIssue) -> Result<PmIssue, SyncError> {
        let issue = pm_issue(
            &format!("{}-999", new.project_identifier),
            &new.project_identifier,
            &new.title,
            new.description.as_deref().unwrap_or(""),
            new.status.as_deref().unwrap_or("Backlog"),
            new.priority.as_deref().unwrap_or("NoPriority"),
            Utc::now().timestamp_millis(),
        );
        self.seed_issue(issue.clone());
        Ok(issue)
    }

    async fn patch_issue(
        &self,
        identifier: &str,
        patch: &PmIssuePatch,
    ) -> Result<PmIssue, SyncError> {
        self.patches
            .lock()
            .unwrap()
            .push((identifier.to_string(), patch.clone()));
        let mut issues = self.issues.lock().unwrap();
        let issue = issues.get_mut(identifier).ok_or_else(|| {
            SyncError::not_found("pm", "patch_issue", format!("{identifier} missing"))
        })?;
        apply_patch(issue, patch);
        Ok(issue.clone())
    }

    async fn bulk_update(
        &self,
        updates: &[BulkUpdateItem],
    ) -> Result<Vec<BulkUpdateOutcome>, SyncError> {
        self.bulk_update_calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = Vec::with_capacity(updates.len());
        for item in updates {
            self.patches
                .lock()
                .unwrap()
                .push((item.identifier.clone(), item.changes.clone()));
            let mut issues = self.issues.lock().unwrap();
            match issues.get_mut(&item.identifier) {
                Some(issue) => {
                    apply_patch(issue, &item.changes);
                    outcomes.push(BulkUpdateOutcome {
                        identifier: item.identifier.clone(),
                        success: true,
                        error: None,
                    });
                }
                None => outcomes.push(BulkUpdateOutcome {
                    identifier: item.identifier.clone(),
                    success: false,
                    error: Some("not found".to_string()),
                }),
            }
        }
        Ok(outcomes)
    }

    async fn set_parent(&self, _identifier: &str, _parent: Option<&str>) -> Result<(), SyncError> {
        Ok(())
    }

    async fn delete_issue(&self, identifier: &str, _cascade: bool) -> Result<(), SyncError> {
        self.issues.lock().unwrap().remove(identifier);
        Ok(())
    }
}

fn apply_patch(issue: &mut PmIssue, patch: &PmIssuePatch) {
    if let Some(title) = &patch.title {
        issue.title = title.clone();
    }
    if let Some(description) = &patch.description {
        issue.description = Some(description.clone());
    }
    if let Some(status) = &patch.status {
        issue.status = status.clone();
    }
    if let Some(priority) = &patch.priority {
        issue.priority = Some(priority.clone());
    }
    issue.modified_on = Utc::now().timestamp_millis();
}

// ---------------------------------------------------------------------------
// FakeTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTracker {
    pub issues: Mutex<HashMap<String, TrackerIssue>>,
    pub creates: AtomicUsize,
    pub updates: Mutex<Vec<(String, TrackerUpdate)>>,
    next_id: AtomicUsize,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_issue(&self, issue: TrackerIssue) {
        self.issues.lock().unwrap().insert(issue.id.clone(), issue);
    }

    pub fn issue(&self, id: &str) -> Option<TrackerIssue> {
        self.issues.lock().unwrap().get(id).cloned()
    }

    pub fn single_issue(&self) -> TrackerIssue {
        let issues = self.issues.lock().unwrap();
        assert_eq!(issues.len(), 1, "expected exactly one tracker issue");
        issues.values().next().unwrap().clone()
    }
}

pub fn tracker_issue(
    id: &str,
    title: &str,
    status: &str,
    priority: i64,
    labels: &[&str],
    updated_at_ms: i64,
) -> TrackerIssue {
    let stamp = Utc
        .timestamp_millis_opt(updated_at_ms)
        .single()
        .unwrap()
        .to_rfc3339();
    TrackerIssue {
        id: id.to_string(),
        title: title.to_string(),
        status: status.to_string(),
        priority,
        issue_type: "task".to_string(),
        created_at: stamp.clone(),
        updated_at: stamp,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        description: None,
    }
}

#[async_trait]
impl TrackerApi for FakeTracker {
    async fn list_issues(&self) -> Result<Vec<TrackerIssue>, SyncError> {
        Ok(self.issues.lock().unwrap().values().cloned().collect())
    }

    async fn show(&self, id: &str) -> Result<Option<TrackerIssue>, SyncError> {
        Ok(self.issues.lock().unwrap().get(id).cloned())
    }

    async fn create_issue(&self, new: &NewTrackerIssue) -> Result<TrackerIssue, SyncError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now().to_rfc3339();
        let issue = TrackerIssue {
            id: format!("bd-fak{n:02}"),
            title: new.title.clone(),
            status: new.status.clone(),
            priority: new.priority,
            issue_type: new.issue_type.clone(),
            created_at: now.clone(),
            updated_at: now,
            labels: new.labels.clone(),
            description: new.description.clone(),
        };
        self.seed_issue(issue.clone());
        Ok(issue)
    }

    async fn update_issue(
        &self,
        id: &str,
        update: &TrackerUpdate,
    ) -> Result<TrackerIssue, SyncError> {
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), update.clone()));
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("tracker", "update", format!("{id} missing")))?;
        if let Some(status) = &update.status {
            issue.status = status.clone();
        }
        if let Some(title) = &update.title {
            issue.title = title.clone();
        }
        if let Some(description) = &update.description {
            issue.description = Some(description.clone());
        }
        if let Some(priority) = update.priority {
            issue.priority = priority;
        }
        issue.updated_at = Utc::now().to_rfc3339();
        Ok(issue.clone())
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.get_mut(id) {
            if !issue.labels.iter().any(|l| l == label) {
                issue.labels.push(label.to_string());
            }
        }
        Ok(())
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        let mut issues = self.issues.lock().unwrap();
        if let Some(issue) = issues.get_mut(id) {
            issue.labels.retain(|l| l != label);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeAgents
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeAgents {
    pub agents: Mutex<Vec<AgentInfo>>,
    pub blocks: Mutex<HashMap<String, Vec<MemoryBlock>>>,
    pub tools: Mutex<HashMap<String, Vec<ToolRef>>>,
    pub api_calls: AtomicUsize,
    pub block_writes: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_agent(&self, id: &str, name: &str, tags: &[&str], created_at_ms: i64) {
        self.agents.lock().unwrap().push(AgentInfo {
            id: id.to_string(),
            name: name.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: Utc.timestamp_millis_opt(created_at_ms).single().unwrap(),
        });
    }

    pub fn calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentsApi for FakeAgents {
    async fn list_agents(
        &self,
        tags: &[String],
        name: Option<&str>,
    ) -> Result<Vec<AgentInfo>, SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .filter(|a| tags.iter().all(|t| a.tags.contains(t)))
            .filter(|a| name.is_none_or(|n| a.name == n))
            .cloned()
            .collect())
    }

    async fn create_agent(&self, req: &NewAgent) -> Result<AgentInfo, SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let agent = AgentInfo {
            id: format!("agent-{n}"),
            name: req.name.clone(),
            tags: req.tags.clone(),
            created_at: Utc::now(),
        };
        self.agents.lock().unwrap().push(agent.clone());
        self.blocks
            .lock()
            .unwrap()
            .insert(agent.id.clone(), req.memory_blocks.clone());
        Ok(agent)
    }

    async fn list_tools(&self, agent_id: &str) -> Result<Vec<ToolRef>, SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tools
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<(), SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        self.tools
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push(ToolRef {
                id: tool_id.to_string(),
                name: tool_id.to_string(),
            });
        Ok(())
    }

    async fn list_memory_blocks(&self, agent_id: &str) -> Result<Vec<MemoryBlock>, SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_memory_block(
        &self,
        agent_id: &str,
        block: &MemoryBlock,
        _exists: bool,
    ) -> Result<(), SyncError> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        self.block_writes.fetch_add(1, Ordering::SeqCst);
        let mut blocks = self.blocks.lock().unwrap();
        let list = blocks.entry(agent_id.to_string()).or_default();
        match list.iter_mut().find(|b| b.label == block.label) {
            Some(existing) => existing.value = block.value.clone(),
            None => list.push(block.clone()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        pm: PmConfig {
            api_url: "http://pm.test".to_string(),
            request_timeout_ms: 1_000,
        },
        tracker: TrackerConfig {
            repo_root: "/tmp/tracker".to_string(),
        },
        agents: AgentsConfig::default(),
        store: StoreConfig::default(),
        http: HttpConfig::default(),
        sync: SyncSettings::default(),
        reconcile: ReconcileConfig::default(),
        daemon: DaemonConfig::default(),
    })
}

pub struct TestEnv {
    pub store: Arc<MappingStore>,
    pub pm: Arc<FakePm>,
    pub tracker: Arc<FakeTracker>,
    pub agents: Arc<FakeAgents>,
    pub provisioner: Arc<AgentProvisioner>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub config: Arc<Config>,
}

pub async fn test_env() -> TestEnv {
    let store = Arc::new(MappingStore::open_in_memory().await.unwrap());
    let pm = FakePm::new();
    let tracker = FakeTracker::new();
    let agents = FakeAgents::new();
    let config = test_config();

    let runner = Arc::new(ActivityRunner::new(
        store.clone(),
        RetryPolicy::new(3, Duration::from_millis(1)),
    ));
    let dedup = Arc::new(DedupCache::new(store.clone(), config.dedupe_ttl()));
    let provisioner = Arc::new(AgentProvisioner::new(agents.clone(), store.clone()));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        pm.clone(),
        tracker.clone(),
        Some(provisioner.clone()),
        runner,
        dedup,
        config.clone(),
    ));

    TestEnv {
        store,
        pm,
        tracker,
        agents,
        provisioner,
        orchestrator,
        config,
    }
}
