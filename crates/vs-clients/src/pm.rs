//! Client for the PM's REST surface, including the bulk-by-projects fetch
//! and bulk update endpoints the orchestrator leans on.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use vs_core::error::SyncError;

use crate::http::HttpCore;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmProject {
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmIssue {
    pub identifier: String,
    #[serde(default)]
    pub project_identifier: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    /// Unix millis.
    pub modified_on: i64,
    #[serde(default)]
    pub parent_identifier: Option<String>,
    #[serde(default)]
    pub sub_issue_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPmIssue {
    pub project_identifier: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Partial update; only populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmIssuePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl PmIssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIssuesRequest {
    pub projects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_descriptions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkProjectIssues {
    pub issues: Vec<PmIssue>,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkIssuesResponse {
    pub projects: HashMap<String, BulkProjectIssues>,
    #[serde(default)]
    pub total_issues: i64,
    #[serde(default)]
    pub project_count: i64,
    #[serde(default)]
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdateItem {
    pub identifier: String,
    pub changes: PmIssuePatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkUpdateOutcome {
    pub identifier: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkUpdateResponse {
    results: Vec<BulkUpdateOutcome>,
}

#[derive(Debug, Deserialize)]
struct ProjectIssuesResponse {
    issues: Vec<PmIssue>,
    #[allow(dead_code)]
    #[serde(default)]
    count: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PmClient {
    core: HttpCore,
    base_url: String,
}

impl PmClient {
    pub fn new(core: HttpCore, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { core, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn list_projects(&self) -> Result<Vec<PmProject>, SyncError> {
        self.core
            .request_json("pm", "list_projects", Method::GET, &self.url("/projects"), None, None)
            .await
    }

    pub async fn list_issues(
        &self,
        project: &str,
        modified_since: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<PmIssue>, SyncError> {
        let mut url = format!("{}/projects/{}/issues", self.base_url, project);
        let mut sep = '?';
        if let Some(ms) = modified_since {
            url.push_str(&format!("{sep}modifiedSince={ms}"));
            sep = '&';
        }
        if let Some(l) = limit {
            url.push_str(&format!("{sep}limit={l}"));
        }
        let resp: ProjectIssuesResponse = self
            .core
            .request_json("pm", "list_issues", Method::GET, &url, None, None)
            .await?;
        Ok(resp.issues)
    }

    pub async fn list_issues_bulk(
        &self,
        req: &BulkIssuesRequest,
    ) -> Result<BulkIssuesResponse, SyncError> {
        let body = serde_json::to_value(req).map_err(|e| {
            SyncError::permanent("pm", "list_issues_bulk", e.to_string()).with_source(e)
        })?;
        self.core
            .request_json(
                "pm",
                "list_issues_bulk",
                Method::POST,
                &self.url("/issues/bulk-by-projects"),
                None,
                Some(&body),
            )
            .await
    }

    /// Explicit recheck used by deletion semantics: 404 is `Ok(None)`.
    pub async fn get_issue(&self, identifier: &str) -> Result<Option<PmIssue>, SyncError> {
        self.core
            .request_json_opt(
                "pm",
                "get_issue",
                Method::GET,
                &self.url(&format!("/issues/{identifier}")),
                None,
                None,
            )
            .await
    }

    pub async fn create_issue(&self, new: &NewPmIssue) -> Result<PmIssue, SyncError> {
        let body = serde_json::to_value(new).map_err(|e| {
            SyncError::permanent("pm", "create_issue", e.to_string()).with_source(e)
        })?;
        self.core
            .request_json("pm", "create_issue", Method::POST, &self.url("/issues"), None, Some(&body))
            .await
    }

    pub async fn patch_issue(
        &self,
        identifier: &str,
        patch: &PmIssuePatch,
    ) -> Result<PmIssue, SyncError> {
        let body = serde_json::to_value(patch).map_err(|e| {
            SyncError::permanent("pm", "patch_issue", e.to_string()).with_source(e)
        })?;
        self.core
            .request_json(
                "pm",
                "patch_issue",
                Method::PATCH,
                &self.url(&format!("/issues/{identifier}")),
                None,
                Some(&body),
            )
            .await
    }

    /// One bulk-update call. The server reports per-row success; a row
    /// failure does not fail the batch.
    pub async fn bulk_update(
        &self,
        updates: &[BulkUpdateItem],
    ) -> Result<Vec<BulkUpdateOutcome>, SyncError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "updates": updates });
        let resp: BulkUpdateResponse = self
            .core
            .request_json(
                "pm",
                "bulk_update",
                Method::PATCH,
                &self.url("/issues/bulk"),
                None,
                Some(&body),
            )
            .await?;
        Ok(resp.results)
    }

    pub async fn set_parent(
        &self,
        identifier: &str,
        parent: Option<&str>,
    ) -> Result<(), SyncError> {
        let body = serde_json::json!({ "parentIdentifier": parent });
        self.core
            .request_raw(
                "pm",
                "set_parent",
                Method::PATCH,
                &self.url(&format!("/issues/{identifier}/parent")),
                None,
                Some(&body),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn delete_issue(&self, identifier: &str, cascade: bool) -> Result<(), SyncError> {
        self.core
            .request_raw(
                "pm",
                "delete_issue",
                Method::DELETE,
                &self.url(&format!("/issues/{identifier}?cascade={cascade}")),
                None,
                None,
                false,
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
