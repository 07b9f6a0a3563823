//! The error taxonomy shared by every component.
//!
//! Errors are a sum over five classes; retry policy is a pure function of
//! the class. Every error carries structured context so that a recorded
//! failure identifies the component, operation, project, and issue that
//! produced it without needing the surrounding log lines.

use crate::types::System;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failures, timeouts, HTTP 408/429/500/502/503/504. Retried
    /// with bounded attempts and jittered backoff; surfaced only after
    /// exhaustion.
    Transient,
    /// HTTP 400/401/403/422, schema mismatches. Fails the individual
    /// operation on the first attempt; never retried.
    Permanent,
    /// HTTP 409 on ensure-kind operations: the entity already exists.
    /// Callers refetch, link, and continue.
    Conflict,
    /// A previously-linked foreign ID no longer resolves upstream.
    NotFound,
    /// A whole system is unreachable; the current project run aborts
    /// cleanly and the next scheduled invocation retries.
    Unavailable,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Conflict => "conflict",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Unavailable => "unavailable",
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

/// A classified error with structured context.
#[derive(Debug, thiserror::Error)]
#[error("[{}] {component}/{operation}{}{} (attempt {attempt}): {message}",
    .class.as_str(),
    .project.as_deref().map(|p| format!(" project={p}")).unwrap_or_default(),
    .identifier.as_deref().map(|i| format!(" issue={i}")).unwrap_or_default())]
pub struct SyncError {
    pub class: ErrorClass,
    pub component: &'static str,
    pub operation: String,
    pub project: Option<String>,
    pub identifier: Option<String>,
    pub attempt: u32,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SyncError {
    pub fn new(
        class: ErrorClass,
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            class,
            component,
            operation: operation.into(),
            project: None,
            identifier: None,
            attempt: 1,
            message: message.into(),
            source: None,
        }
    }

    pub fn transient(
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorClass::Transient, component, operation, message)
    }

    pub fn permanent(
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorClass::Permanent, component, operation, message)
    }

    pub fn conflict(
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorClass::Conflict, component, operation, message)
    }

    pub fn not_found(
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorClass::NotFound, component, operation, message)
    }

    pub fn unavailable(
        component: &'static str,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorClass::Unavailable, component, operation, message)
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Classify an HTTP status code per the taxonomy. `None` for statuses
    /// that are not errors.
    pub fn class_for_status(status: u16) -> Option<ErrorClass> {
        match status {
            200..=399 => None,
            408 | 429 | 500 | 502 | 503 | 504 => Some(ErrorClass::Transient),
            404 => Some(ErrorClass::NotFound),
            409 => Some(ErrorClass::Conflict),
            400..=499 => Some(ErrorClass::Permanent),
            _ => Some(ErrorClass::Transient),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    /// Which system produced this error, derived from the component tag.
    pub fn system(&self) -> Option<System> {
        match self.component {
            "pm" => Some(System::Pm),
            "tracker" => Some(System::Tracker),
            "agents" => Some(System::Agents),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(SyncError::class_for_status(200), None);
        assert_eq!(
            SyncError::class_for_status(429),
            Some(ErrorClass::Transient)
        );
        assert_eq!(
            SyncError::class_for_status(503),
            Some(ErrorClass::Transient)
        );
        assert_eq!(SyncError::class_for_status(404), Some(ErrorClass::NotFound));
        assert_eq!(SyncError::class_for_status(409), Some(ErrorClass::Conflict));
        assert_eq!(SyncError::class_for_status(422), Some(ErrorClass::Permanent));
        assert_eq!(SyncError::class_for_status(401), Some(ErrorClass::Permanent));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
        assert!(!ErrorClass::Conflict.is_retryable());
        assert!(!ErrorClass::NotFound.is_retryable());
        assert!(!ErrorClass::Unavailable.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = SyncError::permanent("pm", "patch_issue", "validation failed")
            .with_project("HVSYN")
            .with_identifier("HVSYN-3")
            .with_attempt(1);
        let text = err.to_string();
        assert!(text.contains("pm/patch_issue"));
        assert!(text.contains("project=HVSYN"));
        assert!(text.contains("issue=HVSYN-3"));
        assert!(text.contains("validation failed"));
    }
}
