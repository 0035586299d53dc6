//! The Store: SQLite-backed, exclusive owner of all persistent metadata.
//!
//! The Store never holds an in-memory vector index handle; it only carries
//! the serialized tag vectors needed to rebuild one. All access is async,
//! routed through `spawn_blocking` since `rusqlite::Connection` is
//! `!Send`/`!Sync`.

mod sqlite;

pub use sqlite::OptionalExt;
pub use sqlite::SqliteStore;
