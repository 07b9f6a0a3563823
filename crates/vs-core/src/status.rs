//! Translation tables between the three status vocabularies.
//!
//! The PM's statuses are a superset and map 1:1 onto the canonical enum.
//! The Tracker has a five-state model (`open`, `in_progress`, `blocked`,
//! `closed`, `deferred`); the distinctions it cannot express natively
//! (Todo vs Backlog, InReview vs InProgress, Canceled vs Done) are carried
//! in a `host:<CanonicalName>` label alongside the native status.

use crate::types::CanonicalStatus;

/// Label prefix for canonical-status disambiguation on Tracker issues.
pub const HOST_LABEL_PREFIX: &str = "host:";

/// Label prefix linking a Tracker issue back to its PM identifier,
/// e.g. `huly:HVSYN-10`.
pub const PM_LINK_LABEL_PREFIX: &str = "huly:";

// ---------------------------------------------------------------------------
// PM <-> canonical
// ---------------------------------------------------------------------------

/// Parse a PM status string. The PM uses the canonical names with spaces
/// ("In Progress"); both spaced and compact spellings are accepted.
pub fn canonical_from_pm(status: &str) -> Option<CanonicalStatus> {
    match status.trim() {
        "Backlog" => Some(CanonicalStatus::Backlog),
        "Todo" => Some(CanonicalStatus::Todo),
        "In Progress" | "InProgress" => Some(CanonicalStatus::InProgress),
        "In Review" | "InReview" => Some(CanonicalStatus::InReview),
        "Done" => Some(CanonicalStatus::Done),
        "Cancelled" | "Canceled" => Some(CanonicalStatus::Canceled),
        _ => None,
    }
}

/// Render a canonical status in the PM's spelling.
pub fn pm_from_canonical(status: CanonicalStatus) -> &'static str {
    match status {
        CanonicalStatus::Backlog => "Backlog",
        CanonicalStatus::Todo => "Todo",
        CanonicalStatus::InProgress => "In Progress",
        CanonicalStatus::InReview => "In Review",
        CanonicalStatus::Done => "Done",
        CanonicalStatus::Canceled => "Cancelled",
    }
}

// ---------------------------------------------------------------------------
// Tracker <-> canonical
// ---------------------------------------------------------------------------

/// A canonical status rendered into the Tracker's model: the native status
/// string plus an optional `host:` label carrying the lost distinction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEncoding {
    pub status: &'static str,
    pub host_label: Option<String>,
}

pub fn tracker_from_canonical(status: CanonicalStatus) -> TrackerEncoding {
    let (native, labeled) = match status {
        CanonicalStatus::Backlog => ("open", false),
        CanonicalStatus::Todo => ("open", true),
        CanonicalStatus::InProgress => ("in_progress", false),
        CanonicalStatus::InReview => ("in_progress", true),
        CanonicalStatus::Done => ("closed", false),
        CanonicalStatus::Canceled => ("closed", true),
    };
    TrackerEncoding {
        status: native,
        host_label: labeled.then(|| format!("{}{}", HOST_LABEL_PREFIX, status.name())),
    }
}

/// Decode a Tracker status plus labels back into the canonical enum.
///
/// A `host:` label wins over the native status when both are present and
/// consistent with it; a label that contradicts the native status is
/// ignored (the native status is what the Tracker actually enforces).
pub fn canonical_from_tracker(status: &str, labels: &[String]) -> CanonicalStatus {
    let labeled = labels
        .iter()
        .filter_map(|l| l.strip_prefix(HOST_LABEL_PREFIX))
        .find_map(CanonicalStatus::from_name);

    match status {
        "open" => match labeled {
            Some(CanonicalStatus::Todo) => CanonicalStatus::Todo,
            _ => CanonicalStatus::Backlog,
        },
        "in_progress" | "blocked" => match labeled {
            Some(CanonicalStatus::InReview) => CanonicalStatus::InReview,
            _ => CanonicalStatus::InProgress,
        },
        "closed" => match labeled {
            Some(CanonicalStatus::Canceled) => CanonicalStatus::Canceled,
            _ => CanonicalStatus::Done,
        },
        // `deferred` has no canonical counterpart; treat as parked backlog.
        "deferred" => CanonicalStatus::Backlog,
        _ => CanonicalStatus::Backlog,
    }
}

/// The `huly:` link label for a canonical identifier.
pub fn pm_link_label(identifier: &str) -> String {
    format!("{}{}", PM_LINK_LABEL_PREFIX, identifier)
}

/// Extract the canonical identifier from a Tracker issue's labels, if the
/// issue carries a `huly:` link label.
pub fn identifier_from_labels(labels: &[String]) -> Option<&str> {
    labels
        .iter()
        .find_map(|l| l.strip_prefix(PM_LINK_LABEL_PREFIX))
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Title normalization
// ---------------------------------------------------------------------------

/// Normalize a title for dedup matching: lowercase, trimmed, leading
/// bracketed tags (`[P0]`, `[bug]`, `[wip]`, ...) stripped, internal
/// whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    let mut rest = title.trim();

    // Strip any run of short leading bracketed prefixes.
    loop {
        let Some(stripped) = rest.strip_prefix('[') else {
            break;
        };
        match stripped.find(']') {
            Some(end) if end <= 12 => rest = stripped[end + 1..].trim_start(),
            _ => break,
        }
    }

    let mut out = String::with_capacity(rest.len());
    let mut last_was_space = false;
    for ch in rest.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
