//! Client for the agent platform: tag-scoped agent lookup, creation with
//! persona memory blocks, tool attachment, and memory-block CRUD.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use vs_core::error::SyncError;

use crate::http::HttpCore;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewAgent {
    pub name: String,
    pub tags: Vec<String>,
    pub memory_blocks: Vec<MemoryBlock>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentsClient {
    core: HttpCore,
    base_url: String,
    token: String,
}

impl AgentsClient {
    pub fn new(core: HttpCore, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            core,
            base_url,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// List agents carrying *all* of `tags`, optionally filtered further by
    /// exact name server-side.
    pub async fn list_agents(
        &self,
        tags: &[String],
        name: Option<&str>,
    ) -> Result<Vec<AgentInfo>, SyncError> {
        let mut url = format!("{}/v1/agents?match_all_tags=true", self.base_url);
        for tag in tags {
            url.push_str("&tags=");
            url.push_str(&urlencode(tag));
        }
        if let Some(name) = name {
            url.push_str("&name=");
            url.push_str(&urlencode(name));
        }
        self.core
            .request_json("agents", "list_agents", Method::GET, &url, Some(&self.token), None)
            .await
    }

    pub async fn create_agent(&self, req: &NewAgent) -> Result<AgentInfo, SyncError> {
        let body = serde_json::to_value(req).map_err(|e| {
            SyncError::permanent("agents", "create_agent", e.to_string()).with_source(e)
        })?;
        self.core
            .request_json(
                "agents",
                "create_agent",
                Method::POST,
                &self.url("/v1/agents"),
                Some(&self.token),
                Some(&body),
            )
            .await
    }

    pub async fn list_tools(&self, agent_id: &str) -> Result<Vec<ToolRef>, SyncError> {
        self.core
            .request_json(
                "agents",
                "list_tools",
                Method::GET,
                &self.url(&format!("/v1/agents/{agent_id}/tools")),
                Some(&self.token),
                None,
            )
            .await
    }

    pub async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<(), SyncError> {
        self.core
            .request_raw(
                "agents",
                "attach_tool",
                Method::PATCH,
                &self.url(&format!("/v1/agents/{agent_id}/tools/attach/{tool_id}")),
                Some(&self.token),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn list_memory_blocks(&self, agent_id: &str) -> Result<Vec<MemoryBlock>, SyncError> {
        self.core
            .request_json(
                "agents",
                "list_memory_blocks",
                Method::GET,
                &self.url(&format!("/v1/agents/{agent_id}/core-memory/blocks")),
                Some(&self.token),
                None,
            )
            .await
    }

    /// Create or replace one labelled block. `exists` selects the verb so
    /// the server never sees a create for a label it already has.
    pub async fn upsert_memory_block(
        &self,
        agent_id: &str,
        block: &MemoryBlock,
        exists: bool,
    ) -> Result<(), SyncError> {
        let body = serde_json::json!({ "label": block.label, "value": block.value });
        let (method, path) = if exists {
            (
                Method::PATCH,
                format!("/v1/agents/{agent_id}/core-memory/blocks/{}", block.label),
            )
        } else {
            (
                Method::POST,
                format!("/v1/agents/{agent_id}/core-memory/blocks"),
            )
        };
        self.core
            .request_raw(
                "agents",
                "upsert_memory_block",
                method,
                &self.url(&path),
                Some(&self.token),
                Some(&body),
                false,
            )
            .await?;
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_chars() {
        assert_eq!(urlencode("project:HVSYN"), "project%3AHVSYN");
        assert_eq!(urlencode("huly-vibe-sync"), "huly-vibe-sync");
        assert_eq!(urlencode("a b"), "a%20b");
    }

    #[test]
    fn agent_info_parses() {
        let json = r#"{
            "id": "agent-7",
            "name": "HVSYN Project Agent",
            "tags": ["huly-vibe-sync", "project:HVSYN"],
            "created_at": "2026-03-01T12:00:00Z"
        }"#;
        let agent: AgentInfo = serde_json::from_str(json).unwrap();
        assert_eq!(agent.tags.len(), 2);
        assert_eq!(agent.id, "agent-7");
    }
}
