//! Agent provisioning and memory-block upkeep.
//!
//! Agents are located by match-all tags plus an exact name; provisioning
//! is idempotent and duplicate-tolerant (newest wins). Memory updates are
//! content-hash gated so an unchanged project costs zero API calls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use vs_clients::agents::{MemoryBlock, NewAgent};
use vs_clients::traits::AgentsApi;
use vs_core::error::SyncError;
use vs_core::types::{stable_hash, CanonicalStatus, Issue, Project};
use vs_store::MappingStore;

/// Tag every engine-managed agent carries.
pub const SYNC_TAG: &str = "huly-vibe-sync";

/// The template agent whose attached tools define the canonical PM-tool
/// bundle copied onto new project agents.
pub const CONTROL_AGENT_NAME: &str = "huly-vibe-control";

/// Memory block values are capped here; longer values are cut and marked.
pub const MAX_BLOCK_CHARS: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n…[truncated]";

/// Concurrent block mutations per update pass.
const BLOCK_CONCURRENCY: usize = 2;

pub fn project_tag(identifier: &str) -> String {
    format!("project:{identifier}")
}

pub fn agent_name(identifier: &str) -> String {
    format!("{identifier} Sync Agent")
}

// ---------------------------------------------------------------------------
// AgentProvisioner
// ---------------------------------------------------------------------------

pub struct AgentProvisioner {
    agents: Arc<dyn AgentsApi>,
    store: Arc<MappingStore>,
    /// agent id -> (block label -> value hash). Process-local; rebuilt
    /// lazily after restart by the first list call.
    hash_cache: DashMap<String, HashMap<String, String>>,
}

impl AgentProvisioner {
    pub fn new(agents: Arc<dyn AgentsApi>, store: Arc<MappingStore>) -> Self {
        Self {
            agents,
            store,
            hash_cache: DashMap::new(),
        }
    }

    /// Ensure the project has exactly one bound agent and return its id.
    ///
    /// Lookup is by match-all tags {sync tag, project tag} and exact name.
    /// Multiple matches select the most recently created and warn; no
    /// match creates a fresh agent seeded with persona blocks and the
    /// control agent's tool bundle.
    pub async fn ensure_agent(&self, project: &Project) -> Result<String, SyncError> {
        let tags = vec![SYNC_TAG.to_string(), project_tag(&project.identifier)];
        let name = agent_name(&project.identifier);

        let mut matches = self.agents.list_agents(&tags, Some(&name)).await?;
        matches.retain(|a| a.name == name);

        let agent_id = match matches.len() {
            0 => self.create_agent(project, tags, name).await?,
            1 => matches.remove(0).id,
            n => {
                matches.sort_by_key(|a| a.created_at);
                let newest = matches.pop().map(|a| a.id).unwrap_or_default();
                warn!(
                    project = %project.identifier,
                    duplicates = n,
                    selected = %newest,
                    "multiple agents match, selected newest; schedule a cleanup of the others"
                );
                newest
            }
        };

        // Authoritative binding lives in the store; the per-project
        // settings file is informational only.
        if project.agent_id.as_deref() != Some(agent_id.as_str()) {
            let mut bound = project.clone();
            bound.agent_id = Some(agent_id.clone());
            self.store.upsert_project(&bound).await.map_err(|e| {
                SyncError::permanent("store", "bind_agent", e.to_string()).with_source(e)
            })?;
        }
        if let Some(fs_path) = &project.fs_path {
            if let Err(e) = write_local_settings(Path::new(fs_path), &agent_id).await {
                warn!(
                    project = %project.identifier,
                    error = %e,
                    "could not write settings.local.json, continuing"
                );
            }
        }

        Ok(agent_id)
    }

    async fn create_agent(
        &self,
        project: &Project,
        tags: Vec<String>,
        name: String,
    ) -> Result<String, SyncError> {
        let persona = MemoryBlock {
            label: "persona".to_string(),
            value: format!(
                "You are the issue-sync assistant for project {} ({}). You keep the \
                 project-management view, the git tracker, and your own memory aligned.",
                project.identifier, project.name
            ),
        };
        let template = MemoryBlock {
            label: "project_overview".to_string(),
            value: format!("Project {} — no sync data yet.", project.identifier),
        };

        let created = self
            .agents
            .create_agent(&NewAgent {
                name,
                tags,
                memory_blocks: vec![persona, template],
            })
            .await?;
        info!(project = %project.identifier, agent = %created.id, "agent created");

        // Copy the canonical tool bundle off the control agent. Missing
        // control agent means no tools; that is a deploy problem worth a
        // warning, not a failed sync.
        match self.find_control_agent().await {
            Ok(Some(control_id)) => {
                let tools = self.agents.list_tools(&control_id).await?;
                for tool in tools {
                    self.agents.attach_tool(&created.id, &tool.id).await?;
                }
            }
            Ok(None) => {
                warn!(
                    control = CONTROL_AGENT_NAME,
                    "control agent not found; new agent has no PM tools"
                );
            }
            Err(e) => {
                warn!(error = %e, "control agent lookup failed; new agent has no PM tools");
            }
        }

        Ok(created.id)
    }

    async fn find_control_agent(&self) -> Result<Option<String>, SyncError> {
        let matches = self
            .agents
            .list_agents(&[SYNC_TAG.to_string()], Some(CONTROL_AGENT_NAME))
            .await?;
        Ok(matches
            .into_iter()
            .find(|a| a.name == CONTROL_AGENT_NAME)
            .map(|a| a.id))
    }

    // -----------------------------------------------------------------------
    // Memory blocks
    // -----------------------------------------------------------------------

    /// Upsert the given blocks on an agent. Returns `true` when any API
    /// write happened.
    ///
    /// The per-agent hash cache short-circuits the common no-change case
    /// without any API call. Otherwise the existing blocks are listed once
    /// and only differing labels are created/updated, at most
    /// [`BLOCK_CONCURRENCY`] in flight.
    pub async fn update_memory_blocks(
        &self,
        agent_id: &str,
        blocks: Vec<MemoryBlock>,
    ) -> Result<bool, SyncError> {
        let blocks: Vec<MemoryBlock> = blocks.into_iter().map(truncate_block).collect();
        let hashes: HashMap<String, String> = blocks
            .iter()
            .map(|b| (b.label.clone(), stable_hash(&[&b.value])))
            .collect();

        if let Some(cached) = self.hash_cache.get(agent_id) {
            let unchanged = hashes
                .iter()
                .all(|(label, hash)| cached.get(label) == Some(hash));
            if unchanged {
                debug!(agent = agent_id, "memory blocks unchanged, skipping");
                return Ok(false);
            }
        }

        let existing = self.agents.list_memory_blocks(agent_id).await?;
        let existing_by_label: HashMap<&str, &str> = existing
            .iter()
            .map(|b| (b.label.as_str(), b.value.as_str()))
            .collect();

        let todo: Vec<(MemoryBlock, bool)> = blocks
            .iter()
            .filter(|b| existing_by_label.get(b.label.as_str()) != Some(&b.value.as_str()))
            .map(|b| (b.clone(), existing_by_label.contains_key(b.label.as_str())))
            .collect();

        let wrote = !todo.is_empty();
        let results: Vec<Result<(), SyncError>> = stream::iter(todo)
            .map(|(block, exists)| {
                let agents = self.agents.clone();
                let agent_id = agent_id.to_string();
                async move { agents.upsert_memory_block(&agent_id, &block, exists).await }
            })
            .buffer_unordered(BLOCK_CONCURRENCY)
            .collect()
            .await;
        for result in results {
            result?;
        }

        self.hash_cache.insert(agent_id.to_string(), hashes);
        Ok(wrote)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn truncate_block(mut block: MemoryBlock) -> MemoryBlock {
    if block.value.chars().count() > MAX_BLOCK_CHARS {
        let keep = MAX_BLOCK_CHARS - TRUNCATION_MARKER.chars().count();
        let mut value: String = block.value.chars().take(keep).collect();
        value.push_str(TRUNCATION_MARKER);
        block.value = value;
    }
    block
}

/// Derive the per-project memory blocks from the post-phase snapshot.
pub fn build_memory_blocks(project: &Project, issues: &[Issue]) -> Vec<MemoryBlock> {
    let mut by_status: HashMap<&'static str, usize> = HashMap::new();
    for issue in issues {
        *by_status.entry(issue.status.name()).or_default() += 1;
    }
    let mut status_line: Vec<String> = by_status
        .into_iter()
        .map(|(status, count)| format!("{status}: {count}"))
        .collect();
    status_line.sort();

    let overview = format!(
        "Project {} ({}) — {} issues. {}",
        project.identifier,
        project.name,
        issues.len(),
        status_line.join(", ")
    );

    let mut open_lines: Vec<String> = issues
        .iter()
        .filter(|i| !matches!(i.status, CanonicalStatus::Done | CanonicalStatus::Canceled))
        .map(|i| format!("- {} [{}] {}", i.identifier, i.status.name(), i.title))
        .collect();
    open_lines.sort();

    vec![
        MemoryBlock {
            label: "project_overview".to_string(),
            value: overview,
        },
        MemoryBlock {
            label: "open_issues".to_string(),
            value: open_lines.join("\n"),
        },
    ]
}

/// Merge the agent id into `<fs_path>/settings.local.json`, preserving any
/// other keys already there.
async fn write_local_settings(fs_path: &Path, agent_id: &str) -> Result<(), SyncError> {
    let path = fs_path.join("settings.local.json");
    let mut root = match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or_else(|_| json!({})),
        Err(_) => json!({}),
    };
    if !root.is_object() {
        root = json!({});
    }
    root["agentId"] = json!(agent_id);
    let text = serde_json::to_string_pretty(&root).map_err(|e| {
        SyncError::permanent("agents", "local_settings", e.to_string()).with_source(e)
    })?;
    tokio::fs::write(&path, text).await.map_err(|e| {
        SyncError::permanent(
            "agents",
            "local_settings",
            format!("cannot write {}: {e}", path.display()),
        )
        .with_source(e)
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_limit_and_adds_marker() {
        let long = MemoryBlock {
            label: "x".into(),
            value: "a".repeat(MAX_BLOCK_CHARS + 500),
        };
        let cut = truncate_block(long);
        assert_eq!(cut.value.chars().count(), MAX_BLOCK_CHARS);
        assert!(cut.value.ends_with(TRUNCATION_MARKER));

        let short = MemoryBlock {
            label: "y".into(),
            value: "hello".into(),
        };
        assert_eq!(truncate_block(short).value, "hello");
    }

    #[test]
    fn memory_blocks_summarize_snapshot() {
        let project = Project::new("HVSYN", "Vibe Sync");
        let mut a = Issue::new("HVSYN-1", "HVSYN");
        a.title = "Fix login".into();
        a.status = CanonicalStatus::InProgress;
        let mut b = Issue::new("HVSYN-2", "HVSYN");
        b.title = "Old".into();
        b.status = CanonicalStatus::Done;

        let blocks = build_memory_blocks(&project, &[a, b]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].value.contains("2 issues"));
        assert!(blocks[1].value.contains("HVSYN-1"));
        assert!(!blocks[1].value.contains("HVSYN-2"));
    }

    #[test]
    fn tag_and_name_conventions() {
        assert_eq!(project_tag("HVSYN"), "project:HVSYN");
        assert_eq!(agent_name("HVSYN"), "HVSYN Sync Agent");
    }

    #[tokio::test]
    async fn local_settings_merge_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.local.json");
        tokio::fs::write(&path, r#"{"theme": "dark"}"#).await.unwrap();

        write_local_settings(dir.path(), "agent-42").await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let root: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(root["agentId"], "agent-42");
        assert_eq!(root["theme"], "dark");
    }
}
