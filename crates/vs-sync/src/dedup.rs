//! Per-project deduplication index.
//!
//! Before any create activity fires, the orchestrator consults this index
//! so that an issue already known under a foreign ID or an equivalent
//! title is linked instead of duplicated. Indexes are materialized from
//! the mapping store on demand and expire after a short TTL; a create that
//! went through invalidates the project's entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use vs_core::error::SyncError;
use vs_core::status::normalize_title;
use vs_core::types::{Issue, System};
use vs_store::MappingStore;

// ---------------------------------------------------------------------------
// DedupIndex
// ---------------------------------------------------------------------------

/// Immutable snapshot of one project's rows, keyed three ways.
#[derive(Debug, Default)]
pub struct DedupIndex {
    by_canonical: HashMap<String, Issue>,
    by_pm_id: HashMap<String, String>,
    by_tracker_id: HashMap<String, String>,
    by_title: HashMap<String, String>,
}

impl DedupIndex {
    pub fn build(rows: Vec<Issue>) -> Self {
        let mut index = DedupIndex::default();
        for row in rows {
            if let Some(pm_id) = &row.pm_id {
                index.by_pm_id.insert(pm_id.clone(), row.identifier.clone());
            }
            if let Some(tracker_id) = &row.tracker_id {
                index
                    .by_tracker_id
                    .insert(tracker_id.clone(), row.identifier.clone());
            }
            index
                .by_title
                .insert(normalize_title(&row.title), row.identifier.clone());
            index.by_canonical.insert(row.identifier.clone(), row);
        }
        index
    }

    pub fn by_canonical(&self, identifier: &str) -> Option<&Issue> {
        self.by_canonical.get(identifier)
    }

    pub fn by_foreign_id(&self, system: System, foreign_id: &str) -> Option<&Issue> {
        let canonical = match system {
            System::Pm => self.by_pm_id.get(foreign_id),
            System::Tracker => self.by_tracker_id.get(foreign_id),
            System::Agents => None,
        }?;
        self.by_canonical.get(canonical)
    }

    /// Match by normalized title (raw title in, normalization applied here).
    pub fn by_title(&self, title: &str) -> Option<&Issue> {
        let canonical = self.by_title.get(&normalize_title(title))?;
        self.by_canonical.get(canonical)
    }

    pub fn len(&self) -> usize {
        self.by_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_canonical.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DedupCache
// ---------------------------------------------------------------------------

pub struct DedupCache {
    store: Arc<MappingStore>,
    ttl: Duration,
    entries: DashMap<String, (Instant, Arc<DedupIndex>)>,
}

impl DedupCache {
    pub fn new(store: Arc<MappingStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Fetch the project's index, rebuilding from the store when absent or
    /// expired.
    pub async fn get(&self, project: &str) -> Result<Arc<DedupIndex>, SyncError> {
        if let Some(entry) = self.entries.get(project) {
            let (built_at, index) = entry.value();
            if built_at.elapsed() < self.ttl {
                return Ok(index.clone());
            }
        }
        self.refresh(project).await
    }

    /// Force a rebuild, bypassing the TTL. Used after any create so the
    /// fresh foreign ID is visible to the rest of the run.
    pub async fn refresh(&self, project: &str) -> Result<Arc<DedupIndex>, SyncError> {
        let rows = self.store.project_issues(project).await.map_err(|e| {
            SyncError::permanent("store", "dedup_refresh", e.to_string())
                .with_project(project)
                .with_source(e)
        })?;
        let index = Arc::new(DedupIndex::build(rows));
        debug!(project, rows = index.len(), "dedup index rebuilt");
        self.entries
            .insert(project.to_string(), (Instant::now(), index.clone()));
        Ok(index)
    }

    pub fn invalidate(&self, project: &str) {
        self.entries.remove(project);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vs_core::types::{CanonicalStatus, Priority};

    fn row(identifier: &str, title: &str, pm: Option<&str>, tracker: Option<&str>) -> Issue {
        let mut issue = Issue::new(identifier, "HVSYN");
        issue.title = title.to_string();
        issue.status = CanonicalStatus::Backlog;
        issue.priority = Priority::Medium;
        issue.pm_id = pm.map(String::from);
        issue.tracker_id = tracker.map(String::from);
        issue.rehash();
        issue
    }

    #[test]
    fn index_keys_three_ways() {
        let index = DedupIndex::build(vec![
            row("HVSYN-1", "[bug] Fix Login", Some("pm-1"), Some("bd-1")),
            row("HVSYN-2", "Add dashboard", None, Some("bd-2")),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.by_canonical("HVSYN-1").unwrap().identifier,
            "HVSYN-1"
        );
        assert_eq!(
            index.by_foreign_id(System::Pm, "pm-1").unwrap().identifier,
            "HVSYN-1"
        );
        assert_eq!(
            index
                .by_foreign_id(System::Tracker, "bd-2")
                .unwrap()
                .identifier,
            "HVSYN-2"
        );
        // Title matching is normalization-aware on both sides.
        assert_eq!(index.by_title("fix   login").unwrap().identifier, "HVSYN-1");
        assert_eq!(index.by_title("[wip] Fix Login").unwrap().identifier, "HVSYN-1");
        assert!(index.by_title("does not exist").is_none());
    }

    #[tokio::test]
    async fn cache_serves_within_ttl_and_refreshes_after() {
        let store = Arc::new(MappingStore::open_in_memory().await.unwrap());
        store
            .upsert_issue(&row("HVSYN-1", "Fix login", None, None))
            .await
            .unwrap();

        let cache = DedupCache::new(store.clone(), Duration::from_secs(60));
        let first = cache.get("HVSYN").await.unwrap();
        assert_eq!(first.len(), 1);

        // A new row is invisible until refresh because the TTL has not
        // passed and the snapshot is immutable.
        store
            .upsert_issue(&row("HVSYN-2", "Another", None, None))
            .await
            .unwrap();
        let cached = cache.get("HVSYN").await.unwrap();
        assert_eq!(cached.len(), 1);

        let refreshed = cache.refresh("HVSYN").await.unwrap();
        assert_eq!(refreshed.len(), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_rebuilt_on_get() {
        let store = Arc::new(MappingStore::open_in_memory().await.unwrap());
        let cache = DedupCache::new(store.clone(), Duration::from_millis(1));
        let empty = cache.get("HVSYN").await.unwrap();
        assert!(empty.is_empty());

        store
            .upsert_issue(&row("HVSYN-1", "Fix login", None, None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let rebuilt = cache.get("HVSYN").await.unwrap();
        assert_eq!(rebuilt.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_entry() {
        let store = Arc::new(MappingStore::open_in_memory().await.unwrap());
        let cache = DedupCache::new(store.clone(), Duration::from_secs(60));
        cache.get("HVSYN").await.unwrap();

        store
            .upsert_issue(&row("HVSYN-1", "Fix login", None, None))
            .await
            .unwrap();
        cache.invalidate("HVSYN");
        assert_eq!(cache.get("HVSYN").await.unwrap().len(), 1);
    }
}
