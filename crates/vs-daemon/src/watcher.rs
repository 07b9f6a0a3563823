//! Filesystem watcher loop.
//!
//! Watches each managed project's filesystem path, folds raw notify
//! events into debounced per-file changes, and dispatches them as
//! `sync-project-files` / `delete-file` activities through the trigger
//! layer's [`FileSyncer`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vs_store::MappingStore;
use vs_sync::{FileEventKind, FileSyncer};

/// Directory names never worth syncing.
const IGNORED_SEGMENTS: &[&str] = &[".git", ".beads", "node_modules", "target"];

pub struct WatcherLoop {
    store: Arc<MappingStore>,
    syncer: Arc<FileSyncer>,
    poll_interval: Duration,
}

impl WatcherLoop {
    pub fn new(store: Arc<MappingStore>, syncer: Arc<FileSyncer>) -> Self {
        Self {
            store,
            syncer,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Run until the shutdown flag flips. Project paths are re-read on
    /// every pass so newly registered projects get watched without a
    /// restart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tx, rx): (
            Sender<notify::Result<notify::Event>>,
            Receiver<notify::Result<notify::Event>>,
        ) = crossbeam_channel::unbounded();

        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "file watcher unavailable, file sync disabled");
                return;
            }
        };

        let mut watched: HashMap<PathBuf, String> = HashMap::new();
        let mut tick = tokio::time::interval(self.poll_interval);
        info!("file watcher loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh_watches(&mut watcher, &mut watched).await;
                    self.drain_events(&rx, &watched).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("file watcher stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn refresh_watches(
        &self,
        watcher: &mut RecommendedWatcher,
        watched: &mut HashMap<PathBuf, String>,
    ) {
        let projects = match self.store.list_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!(error = %e, "cannot list projects for watching");
                return;
            }
        };
        for project in projects {
            let Some(fs_path) = &project.fs_path else {
                continue;
            };
            let path = PathBuf::from(fs_path);
            if watched.contains_key(&path) {
                continue;
            }
            if !path.is_dir() {
                warn!(project = %project.identifier, path = %path.display(),
                    "project path missing or not a directory, skipping watch");
                continue;
            }
            match watcher.watch(&path, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!(project = %project.identifier, path = %path.display(), "watching");
                    watched.insert(path, project.identifier.clone());
                }
                Err(e) => {
                    warn!(project = %project.identifier, error = %e, "watch failed");
                }
            }
        }
    }

    async fn drain_events(
        &self,
        rx: &Receiver<notify::Result<notify::Event>>,
        watched: &HashMap<PathBuf, String>,
    ) {
        // Fold the burst into one debounced action per file; the last
        // event kind for a path wins.
        let mut changes: HashMap<(String, PathBuf, String), FileEventKind> = HashMap::new();

        while let Ok(result) = rx.try_recv() {
            let Ok(event) = result else { continue };
            let kind = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => FileEventKind::AddOrChange,
                EventKind::Remove(_) => FileEventKind::Unlink,
                _ => continue,
            };
            for path in event.paths {
                if is_ignored(&path) {
                    continue;
                }
                let Some((root, project)) = owner_of(&path, watched) else {
                    continue;
                };
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().into_owned();
                changes.insert((project, root, rel), kind);
            }
        }

        for ((project, root, rel), kind) in changes {
            debug!(project = %project, file = %rel, ?kind, "file event");
            if let Err(e) = self.syncer.handle_event(&project, &root, &rel, kind).await {
                warn!(project = %project, file = %rel, error = %e, "file sync failed");
            }
        }
    }
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| IGNORED_SEGMENTS.contains(&s))
            .unwrap_or(false)
    })
}

fn owner_of(path: &Path, watched: &HashMap<PathBuf, String>) -> Option<(PathBuf, String)> {
    watched
        .iter()
        .filter(|(root, _)| path.starts_with(root))
        // Deepest root wins when paths nest.
        .max_by_key(|(root, _)| root.components().count())
        .map(|(root, project)| (root.clone(), project.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
