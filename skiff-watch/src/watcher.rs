use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;

/// File system change event inside the drop directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Type of file system change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// Watches a single drop directory (non-recursive) and forwards raw events
/// into a bounded channel for the stabilizer to consume.
///
/// Hidden files and editor/temp artifacts are filtered here so they never
/// become transfer candidates.
pub struct DropWatcher {
    path: PathBuf,
    _watcher: Option<RecommendedWatcher>,
}

impl DropWatcher {
    /// Create a new watcher for a directory.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _watcher: None,
        }
    }

    /// Get the path being watched
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start watching, forwarding events into `events`.
    ///
    /// The notify callback runs on its own thread; a full channel drops the
    /// event with a warning rather than blocking the watcher. A dropped event
    /// is recovered by the stabilizer's next size poll, so this only delays a
    /// reset, it never loses a file.
    pub fn start(&mut self, events: mpsc::Sender<FileEvent>) -> Result<()> {
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        for file_event in convert_notify_event(event) {
                            if let Err(e) = events.try_send(file_event) {
                                warn!("Dropping file event, channel full or closed: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("File watcher error: {}", e);
                    }
                }
            })?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        info!("Watching drop directory: {}", self.path.display());

        self._watcher = Some(watcher);
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        if self._watcher.take().is_some() {
            info!("Stopped watching: {}", self.path.display());
        }
    }
}

/// Filter out files that should never become transfer candidates.
fn should_ignore(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        // Hidden files
        if name.starts_with('.') {
            return true;
        }

        // Temporary files
        if name.ends_with('~') || name.ends_with(".tmp") || name.ends_with(".swp") {
            return true;
        }

        // Common editor temp files
        if name.starts_with('#') && name.ends_with('#') {
            return true;
        }
    }

    false
}

/// Convert a notify event to our event format, dropping ignored paths.
fn convert_notify_event(event: Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Created,
        EventKind::Modify(_) => FileEventKind::Modified,
        EventKind::Remove(_) => FileEventKind::Deleted,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| {
            if should_ignore(path) {
                debug!("Ignoring event for {}", path.display());
                false
            } else {
                true
            }
        })
        .map(|path| FileEvent { path, kind })
        .collect()
}
