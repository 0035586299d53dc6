//! The Ingestion Pipeline: watches a filesystem tree, batches changes,
//! and drives the commit-then-index-mutate write path shared by the
//! Store and the Index Registry.

mod filter;
mod pipeline;
mod watcher;

pub use filter::FileFilter;
pub use pipeline::IngestionPipeline;
pub use pipeline::IngestionStats;
pub use watcher::FileWatcher;
pub use watcher::WatchEvent;
pub use watcher::WatchEventKind;
