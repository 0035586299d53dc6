//! Debounced filesystem watcher built on `notify` / `notify-debouncer-mini`.
//!
//! The watcher's lifetime is tied to the `KnowledgeBase` that owns it: it
//! is created in `initialize` and dropped in `shutdown`, never kept as
//! process-wide global state.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use notify_debouncer_mini::new_debouncer;
use notify_debouncer_mini::DebounceEventResult;
use notify_debouncer_mini::DebouncedEventKind;
use tokio::sync::mpsc;

use crate::error::KbeError;
use crate::error::Result;
use crate::ingestion::filter::FileFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

/// Owns a background debouncer thread and forwards filtered events over an
/// async channel.
pub struct FileWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl FileWatcher {
    pub fn start(root: &Path, debounce: Duration, filter: FileFilter) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let Ok(events) = result else {
                tracing::warn!("file watcher error");
                return;
            };
            for event in events {
                if filter.is_ignored(&event.path) {
                    continue;
                }
                let kind = match event.kind {
                    DebouncedEventKind::Any => {
                        if event.path.exists() {
                            WatchEventKind::Changed
                        } else {
                            WatchEventKind::Removed
                        }
                    }
                    _ => WatchEventKind::Changed,
                };
                let _ = tx.send(WatchEvent { path: event.path, kind });
            }
        })
        .map_err(|e| KbeError::WatchFailed { cause: e.to_string() })?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)
            .map_err(|e| KbeError::WatchFailed { cause: e.to_string() })?;

        Ok(Self { _debouncer: debouncer, receiver: rx })
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}
