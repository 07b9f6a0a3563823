//! Durable-activity executor.
//!
//! Every cross-system mutation runs as an *activity*: a plain-data-in,
//! plain-data-out closure that is safe to invoke more than once. The
//! runner provides at-least-once execution with bounded retry on transient
//! errors, persists each activity boundary as a pending-op record in the
//! mapping store, and fails fast on everything non-retryable. Activities
//! themselves are responsible for checking the store/dedup index first and
//! returning `skipped` when the effect is already present.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vs_core::error::{ErrorClass, SyncError};
use vs_core::types::{PendingOp, PendingOpType, System};
use vs_store::MappingStore;

// ---------------------------------------------------------------------------
// ActivityOutcome
// ---------------------------------------------------------------------------

/// The plain-data result every activity returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityOutcome {
    pub success: bool,
    pub id: Option<String>,
    pub created: bool,
    pub updated: bool,
    pub skipped: bool,
    pub error: Option<String>,
    /// How many invocations the runner made; 1 unless transient retries
    /// happened.
    pub attempts: u32,
}

impl ActivityOutcome {
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            created: true,
            ..Default::default()
        }
    }

    pub fn updated(id: impl Into<String>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            updated: true,
            ..Default::default()
        }
    }

    /// The effect was already present; nothing was sent anywhere.
    pub fn skipped(id: Option<String>) -> Self {
        Self {
            success: true,
            id,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn failed(error: &SyncError, attempts: u32) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            attempts,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry policy as a pure function of attempt number and error class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            ..Self::default()
        }
    }

    /// Whether a failed attempt should be retried. Only transient errors
    /// qualify, and only while attempts remain.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class.is_retryable() && attempt < self.max_attempts
    }

    /// Backoff floor for the given 1-indexed attempt; strictly
    /// non-decreasing in `attempt`. Jitter is added separately at sleep
    /// time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1).min(16)))
            .min(self.max_backoff)
    }
}

// ---------------------------------------------------------------------------
// ActivityContext
// ---------------------------------------------------------------------------

/// Describes one activity invocation: a name for logs and, when the
/// activity mutates a remote system, the pending-op bracket to persist
/// around it.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub name: &'static str,
    pub project: Option<String>,
    pub identifier: Option<String>,
    /// Present for mutating activities: the durable intent record.
    pub op: Option<(PendingOpType, System, serde_json::Value)>,
}

impl ActivityContext {
    pub fn read_only(name: &'static str) -> Self {
        Self {
            name,
            project: None,
            identifier: None,
            op: None,
        }
    }

    pub fn mutating(
        name: &'static str,
        op_type: PendingOpType,
        target: System,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name,
            project: None,
            identifier: None,
            op: Some((op_type, target, payload)),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ActivityRunner
// ---------------------------------------------------------------------------

pub struct ActivityRunner {
    store: Arc<MappingStore>,
    policy: RetryPolicy,
}

impl ActivityRunner {
    pub fn new(store: Arc<MappingStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute an activity with at-least-once semantics.
    ///
    /// The closure receives the attempt number (1-indexed) and may be
    /// invoked up to `max_attempts` times for transient failures. A
    /// pending-op record brackets the whole execution when the context
    /// declares a mutation; its resolution carries the final outcome so
    /// crash recovery can tell a completed effect from an abandoned one.
    ///
    /// Returns `Err` only for mapping-store failures, which are fatal to
    /// the surrounding sync; activity failures come back as an
    /// unsuccessful [`ActivityOutcome`].
    pub async fn run<F, Fut>(
        &self,
        ctx: ActivityContext,
        f: F,
    ) -> Result<ActivityOutcome, SyncError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<ActivityOutcome, SyncError>>,
    {
        let pending = match &ctx.op {
            Some((op_type, target, payload)) => {
                let op = PendingOp::new(*op_type, *target, payload.clone());
                self.store.create_pending_op(&op).await.map_err(store_err)?;
                Some(op)
            }
            None => None,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f(attempt).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    if let Some(op) = &pending {
                        let result = serde_json::to_value(&outcome).ok();
                        self.store
                            .mark_pending_op_succeeded(op.id, result)
                            .await
                            .map_err(store_err)?;
                    }
                    debug!(
                        activity = ctx.name,
                        attempts = attempt,
                        created = outcome.created,
                        updated = outcome.updated,
                        skipped = outcome.skipped,
                        "activity completed"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    let mut e = e.with_attempt(attempt);
                    if let Some(project) = &ctx.project {
                        e = e.with_project(project.clone());
                    }
                    if let Some(identifier) = &ctx.identifier {
                        e = e.with_identifier(identifier.clone());
                    }
                    if self.policy.should_retry(e.class, attempt) {
                        let floor = self.policy.delay_for(attempt);
                        let delay = floor + jitter_upto(floor / 2);
                        debug!(
                            activity = ctx.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient activity failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!(activity = ctx.name, attempts = attempt, error = %e, "activity failed");
                    let outcome = ActivityOutcome::failed(&e, attempt);
                    if let Some(op) = &pending {
                        let result = serde_json::to_value(&outcome).ok();
                        self.store
                            .mark_pending_op_failed(op.id, result)
                            .await
                            .map_err(store_err)?;
                    }
                    return Ok(outcome);
                }
            }
        }
    }
}

fn store_err(e: vs_store::StoreError) -> SyncError {
    SyncError::permanent("store", "pending_op", e.to_string()).with_source(e)
}

fn jitter_upto(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..=max.as_millis() as u64))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
