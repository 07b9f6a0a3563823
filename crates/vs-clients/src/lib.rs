//! Typed clients for the three external systems.
//!
//! Each client is stateless apart from the shared HTTP connection pool and
//! its throttle state. The orchestrator talks to the clients through the
//! narrow per-capability traits in [`traits`], so tests swap in fakes at
//! composition time.

pub mod agents;
pub mod http;
pub mod pm;
pub mod tracker;
pub mod traits;

pub use agents::{AgentInfo, AgentsClient, MemoryBlock, NewAgent, ToolRef};
pub use http::HttpCore;
pub use pm::{
    BulkIssuesRequest, BulkIssuesResponse, BulkUpdateItem, BulkUpdateOutcome, NewPmIssue,
    PmClient, PmIssue, PmIssuePatch, PmProject,
};
pub use tracker::{NewTrackerIssue, TrackerClient, TrackerIssue, TrackerUpdate};
pub use traits::{AgentsApi, PmApi, TrackerApi};
