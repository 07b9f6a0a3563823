//! Narrow per-capability interfaces the sync layer consumes.
//!
//! Three independent concrete clients sit behind these traits, selected at
//! composition time; tests substitute in-memory fakes.

use async_trait::async_trait;

use vs_core::error::SyncError;

use crate::agents::{AgentInfo, AgentsClient, MemoryBlock, NewAgent, ToolRef};
use crate::pm::{
    BulkIssuesRequest, BulkIssuesResponse, BulkUpdateItem, BulkUpdateOutcome, NewPmIssue,
    PmClient, PmIssue, PmIssuePatch, PmProject,
};
use crate::tracker::{NewTrackerIssue, TrackerClient, TrackerIssue, TrackerUpdate};

// ---------------------------------------------------------------------------
// PmApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PmApi: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<PmProject>, SyncError>;
    async fn list_issues_bulk(
        &self,
        req: &BulkIssuesRequest,
    ) -> Result<BulkIssuesResponse, SyncError>;
    async fn get_issue(&self, identifier: &str) -> Result<Option<PmIssue>, SyncError>;
    async fn create_issue(&self, new: &NewPmIssue) -> Result<PmIssue, SyncError>;
    async fn patch_issue(
        &self,
        identifier: &str,
        patch: &PmIssuePatch,
    ) -> Result<PmIssue, SyncError>;
    async fn bulk_update(
        &self,
        updates: &[BulkUpdateItem],
    ) -> Result<Vec<BulkUpdateOutcome>, SyncError>;
    async fn set_parent(&self, identifier: &str, parent: Option<&str>) -> Result<(), SyncError>;
    async fn delete_issue(&self, identifier: &str, cascade: bool) -> Result<(), SyncError>;
}

#[async_trait]
impl PmApi for PmClient {
    async fn list_projects(&self) -> Result<Vec<PmProject>, SyncError> {
        PmClient::list_projects(self).await
    }
    async fn list_issues_bulk(
        &self,
        req: &BulkIssuesRequest,
    ) -> Result<BulkIssuesResponse, SyncError> {
        PmClient::list_issues_bulk(self, req).await
    }
    async fn get_issue(&self, identifier: &str) -> Result<Option<PmIssue>, SyncError> {
        PmClient::get_issue(self, identifier).await
    }
    async fn create_issue(&self, new: &NewPmIssue) -> Result<PmIssue, SyncError> {
        PmClient::create_issue(self, new).await
    }
    async fn patch_issue(
        &self,
        identifier: &str,
        patch: &PmIssuePatch,
    ) -> Result<PmIssue, SyncError> {
        PmClient::patch_issue(self, identifier, patch).await
    }
    async fn bulk_update(
        &self,
        updates: &[BulkUpdateItem],
    ) -> Result<Vec<BulkUpdateOutcome>, SyncError> {
        PmClient::bulk_update(self, updates).await
    }
    async fn set_parent(&self, identifier: &str, parent: Option<&str>) -> Result<(), SyncError> {
        PmClient::set_parent(self, identifier, parent).await
    }
    async fn delete_issue(&self, identifier: &str, cascade: bool) -> Result<(), SyncError> {
        PmClient::delete_issue(self, identifier, cascade).await
    }
}

// ---------------------------------------------------------------------------
// TrackerApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TrackerApi: Send + Sync {
    async fn list_issues(&self) -> Result<Vec<TrackerIssue>, SyncError>;
    async fn show(&self, id: &str) -> Result<Option<TrackerIssue>, SyncError>;
    async fn create_issue(&self, new: &NewTrackerIssue) -> Result<TrackerIssue, SyncError>;
    async fn update_issue(
        &self,
        id: &str,
        update: &TrackerUpdate,
    ) -> Result<TrackerIssue, SyncError>;
    async fn add_label(&self, id: &str, label: &str) -> Result<(), SyncError>;
    async fn remove_label(&self, id: &str, label: &str) -> Result<(), SyncError>;
}

#[async_trait]
impl TrackerApi for TrackerClient {
    async fn list_issues(&self) -> Result<Vec<TrackerIssue>, SyncError> {
        TrackerClient::list_issues(self).await
    }
    async fn show(&self, id: &str) -> Result<Option<TrackerIssue>, SyncError> {
        TrackerClient::show(self, id).await
    }
    async fn create_issue(&self, new: &NewTrackerIssue) -> Result<TrackerIssue, SyncError> {
        TrackerClient::create_issue(self, new).await
    }
    async fn update_issue(
        &self,
        id: &str,
        update: &TrackerUpdate,
    ) -> Result<TrackerIssue, SyncError> {
        TrackerClient::update_issue(self, id, update).await
    }
    async fn add_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        TrackerClient::add_label(self, id, label).await
    }
    async fn remove_label(&self, id: &str, label: &str) -> Result<(), SyncError> {
        TrackerClient::remove_label(self, id, label).await
    }
}

// ---------------------------------------------------------------------------
// AgentsApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgentsApi: Send + Sync {
    async fn list_agents(
        &self,
        tags: &[String],
        name: Option<&str>,
    ) -> Result<Vec<AgentInfo>, SyncError>;
    async fn create_agent(&self, req: &NewAgent) -> Result<AgentInfo, SyncError>;
    async fn list_tools(&self, agent_id: &str) -> Result<Vec<ToolRef>, SyncError>;
    async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<(), SyncError>;
    async fn list_memory_blocks(&self, agent_id: &str) -> Result<Vec<MemoryBlock>, SyncError>;
    async fn upsert_memory_block(
        &self,
        agent_id: &str,
        block: &MemoryBlock,
        exists: bool,
    ) -> Result<(), SyncError>;
}

#[async_trait]
impl AgentsApi for AgentsClient {
    async fn list_agents(
        &self,
        tags: &[String],
        name: Option<&str>,
    ) -> Result<Vec<AgentInfo>, SyncError> {
        AgentsClient::list_agents(self, tags, name).await
    }
    async fn create_agent(&self, req: &NewAgent) -> Result<AgentInfo, SyncError> {
        AgentsClient::create_agent(self, req).await
    }
    async fn list_tools(&self, agent_id: &str) -> Result<Vec<ToolRef>, SyncError> {
        AgentsClient::list_tools(self, agent_id).await
    }
    async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<(), SyncError> {
        AgentsClient::attach_tool(self, agent_id, tool_id).await
    }
    async fn list_memory_blocks(&self, agent_id: &str) -> Result<Vec<MemoryBlock>, SyncError> {
        AgentsClient::list_memory_blocks(self, agent_id).await
    }
    async fn upsert_memory_block(
        &self,
        agent_id: &str,
        block: &MemoryBlock,
        exists: bool,
    ) -> Result<(), SyncError> {
        AgentsClient::upsert_memory_block(self, agent_id, block, exists).await
    }
}
