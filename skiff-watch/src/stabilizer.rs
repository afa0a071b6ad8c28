use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::watcher::{FileEvent, FileEventKind};

/// A file whose size has stopped changing and is ready for transfer.
#[derive(Debug, Clone)]
pub struct StableFile {
    pub path: PathBuf,
    /// When the file was first noticed in the drop directory.
    pub discovered_at: DateTime<Utc>,
}

/// How the stabilizer decides a file is done being written.
#[derive(Debug, Clone)]
pub struct StabilizerSettings {
    /// Consecutive polls with an unchanged size required before promotion.
    pub stability_polls: u32,

    /// Interval between size polls.
    pub poll_interval: Duration,
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self {
            stability_polls: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

struct Candidate {
    discovered_at: DateTime<Utc>,
    last_size: Option<u64>,
    stable_polls: u32,
}

/// Debounces raw watcher events into at-most-one promotion per settled file.
///
/// A file under active write keeps changing size between polls, so its
/// counter keeps resetting; only after `stability_polls` consecutive
/// unchanged sizes is it promoted. Promotion removes the candidate, so a
/// burst of create/modify events for the same write produces exactly one
/// [`StableFile`].
pub struct Stabilizer {
    settings: StabilizerSettings,
    events: mpsc::Receiver<FileEvent>,
    promoted: mpsc::Sender<StableFile>,
    candidates: HashMap<PathBuf, Candidate>,
}

impl Stabilizer {
    pub fn new(
        settings: StabilizerSettings,
        events: mpsc::Receiver<FileEvent>,
        promoted: mpsc::Sender<StableFile>,
    ) -> Self {
        Self {
            settings,
            events,
            promoted,
            candidates: HashMap::new(),
        }
    }

    /// Run until the event channel closes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Event channel closed, stabilizer exiting");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.poll_candidates().await.is_err() {
                        warn!("Promotion channel closed, stabilizer exiting");
                        break;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Created | FileEventKind::Modified => {
                let candidate = self
                    .candidates
                    .entry(event.path.clone())
                    .or_insert_with(|| {
                        debug!("New transfer candidate: {}", event.path.display());
                        Candidate {
                            discovered_at: Utc::now(),
                            last_size: None,
                            stable_polls: 0,
                        }
                    });
                // Any write activity restarts the stability countdown
                candidate.stable_polls = 0;
            }
            FileEventKind::Deleted => {
                if self.candidates.remove(&event.path).is_some() {
                    debug!(
                        "Candidate removed before stabilizing: {}",
                        event.path.display()
                    );
                }
            }
        }
    }

    async fn poll_candidates(&mut self) -> Result<(), mpsc::error::SendError<StableFile>> {
        let paths: Vec<PathBuf> = self.candidates.keys().cloned().collect();

        for path in paths {
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => {
                    // Directories and other non-files are not candidates
                    self.candidates.remove(&path);
                    continue;
                }
                Err(_) => {
                    debug!("Candidate vanished before stabilizing: {}", path.display());
                    self.candidates.remove(&path);
                    continue;
                }
            };

            let candidate = match self.candidates.get_mut(&path) {
                Some(c) => c,
                None => continue,
            };

            if candidate.last_size == Some(size) {
                candidate.stable_polls += 1;
                trace!(
                    "{}: {} stable poll(s) at {} bytes",
                    path.display(),
                    candidate.stable_polls,
                    size
                );
            } else {
                candidate.last_size = Some(size);
                candidate.stable_polls = 0;
            }

            if candidate.stable_polls >= self.settings.stability_polls {
                let discovered_at = candidate.discovered_at;
                self.candidates.remove(&path);
                info!("File stabilized at {} bytes: {}", size, path.display());
                self.promoted
                    .send(StableFile {
                        path,
                        discovered_at,
                    })
                    .await?;
            }
        }

        Ok(())
    }
}
