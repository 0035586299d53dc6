//! SQLite storage layer.
//!
//! Provides async-safe SQLite operations using spawn_blocking. The Store is
//! the single writer of record: every batch commit here happens-before any
//! ANN index mutation (see `registry`).

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension as _;
use tokio::task::spawn_blocking;

use crate::error::KbeError;
use crate::error::Result;
use crate::types::Chunk;
use crate::types::FileRecord;
use crate::types::Tag;

/// Async-safe SQLite store.
///
/// rusqlite::Connection is not Send + Sync, so we wrap it in Arc<Mutex<>>.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a SQLite database, enabling WAL mode so concurrent
    /// readers are not blocked by an in-flight writer.
    pub fn open(path: &Path) -> Result<Self> {
        let path_buf = path.to_path_buf();
        let conn = Connection::open(path).map_err(|e| KbeError::sqlite_error(&path_buf, e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| KbeError::sqlite_error(&path_buf, e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| KbeError::sqlite_error(&path_buf, e))?;
        Self::init_schema(&conn, &path_buf)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(conn: &Connection, path: &PathBuf) -> Result<()> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| KbeError::Sqlite {
                path: path.clone(),
                cause: format!("schema init failed: {e}"),
            })?;
        Ok(())
    }

    /// Execute a read or write operation asynchronously.
    pub async fn query<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();

        spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| {
                tracing::warn!(path = %path.display(), "mutex poisoned, recovering");
                let inner = poisoned.into_inner();
                if !inner.is_autocommit() {
                    tracing::warn!(path = %path.display(), "connection not in autocommit after poisoning, attempting rollback");
                    if let Err(e) = inner.execute("ROLLBACK", []) {
                        tracing::error!(path = %path.display(), error = %e, "rollback failed after poisoning recovery");
                    }
                }
                inner
            });
            f(&guard)
        })
        .await
        .map_err(|e| KbeError::Sqlite {
            path: self.path.clone(),
            cause: format!("spawn_blocking failed: {e}"),
        })?
    }

    /// Execute a transaction asynchronously. Per the coroutine-control-flow
    /// rule, callers must not await on external services between acquiring
    /// the inputs to write and calling this: there must be no suspension
    /// point inside the transaction body.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();

        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| {
                tracing::warn!(path = %path.display(), "mutex poisoned in transaction, recovering");
                let inner = poisoned.into_inner();
                if !inner.is_autocommit() {
                    if let Err(e) = inner.execute("ROLLBACK", []) {
                        tracing::error!(path = %path.display(), error = %e, "rollback failed after poisoning recovery");
                    }
                }
                inner
            });

            let tx = guard.transaction().map_err(|e| KbeError::Sqlite {
                path: path.clone(),
                cause: format!("transaction start failed: {e}"),
            })?;
            let result = f(&tx)?;
            tx.commit().map_err(|e| KbeError::Sqlite {
                path: path.clone(),
                cause: format!("transaction commit failed: {e}"),
            })?;
            Ok(result)
        })
        .await
        .map_err(|e| KbeError::Sqlite {
            path: self.path.clone(),
            cause: format!("spawn_blocking failed: {e}"),
        })?
    }

    // ---- File operations -------------------------------------------------

    pub async fn upsert_file(&self, diary: String, path: String, content_hash: String, mtime: i64) -> Result<FileRecord> {
        self.query(move |conn| {
            let now = now_unix();
            conn.execute(
                "INSERT INTO files (diary, path, content_hash, mtime, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(diary, path) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    mtime = excluded.mtime,
                    indexed_at = excluded.indexed_at",
                params![diary, path, content_hash, mtime, now],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM files WHERE diary = ?1 AND path = ?2",
                params![diary, path],
                |r| r.get(0),
            )?;
            Ok(FileRecord { id, diary, path, content_hash, mtime, indexed_at: now })
        })
        .await
    }

    pub async fn get_file(&self, diary: String, path: String) -> Result<Option<FileRecord>> {
        self.query(move |conn| {
            conn.query_row(
                "SELECT id, diary, path, content_hash, mtime, indexed_at FROM files WHERE diary = ?1 AND path = ?2",
                params![diary, path],
                |r| {
                    Ok(FileRecord {
                        id: r.get(0)?,
                        diary: r.get(1)?,
                        path: r.get(2)?,
                        content_hash: r.get(3)?,
                        mtime: r.get(4)?,
                        indexed_at: r.get(5)?,
                    })
                },
            )
            .optional_with_path(Path::new(""))
        })
        .await
    }

    pub async fn delete_file(&self, diary: String, path: String) -> Result<()> {
        self.query(move |conn| {
            conn.execute("DELETE FROM files WHERE diary = ?1 AND path = ?2", params![diary, path])?;
            Ok(())
        })
        .await
    }

    pub async fn list_diaries(&self) -> Result<Vec<String>> {
        self.query(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT diary FROM files ORDER BY diary")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Chunk operations -------------------------------------------------

    /// Replace all chunks belonging to `file_id` in a single transaction.
    /// Called within the same commit as `upsert_file` for that file.
    ///
    /// A chunk's vector is `None` when the embedder skipped it (oversize
    /// input, or content that normalized to the empty-content sentinel);
    /// persisting it here (rather than only in the ANN index) is what lets
    /// `recover_from_store` rebuild a diary's index from scratch.
    pub fn replace_chunks(conn: &Connection, file_id: i64, chunks: &[(i32, String, usize, Option<Vec<f32>>)]) -> Result<Vec<i64>> {
        conn.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
        let mut ids = Vec::with_capacity(chunks.len());
        let mut stmt = conn.prepare(
            "INSERT INTO chunks (file_id, ordinal, text, token_count, vector) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (ordinal, text, token_count, vector) in chunks {
            let bytes = vector.as_ref().map(|v| vector_to_bytes(v));
            stmt.execute(params![file_id, ordinal, text, *token_count as i64, bytes])?;
            ids.push(conn.last_insert_rowid());
        }
        Ok(ids)
    }

    pub async fn hydrate_chunks(&self, ids: Vec<i64>) -> Result<Vec<Chunk>> {
        self.query(move |conn| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let chunk = conn
                    .query_row(
                        "SELECT id, file_id, ordinal, text, token_count, vector FROM chunks WHERE id = ?1",
                        params![id],
                        |r| {
                            Ok(Chunk {
                                id: r.get(0)?,
                                file_id: r.get(1)?,
                                ordinal: r.get(2)?,
                                text: r.get(3)?,
                                token_count: r.get::<_, i64>(4)? as usize,
                                vector: r.get::<_, Option<Vec<u8>>>(5)?.map(|b| bytes_to_vector(&b)),
                            })
                        },
                    )
                    .optional()?;
                if let Some(chunk) = chunk {
                    out.push(chunk);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn iter_chunks(&self, file_id: i64) -> Result<Vec<Chunk>> {
        self.query(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_id, ordinal, text, token_count, vector FROM chunks WHERE file_id = ?1 ORDER BY ordinal ASC",
            )?;
            let rows = stmt.query_map(params![file_id], |r| {
                Ok(Chunk {
                    id: r.get(0)?,
                    file_id: r.get(1)?,
                    ordinal: r.get(2)?,
                    text: r.get(3)?,
                    token_count: r.get::<_, i64>(4)? as usize,
                    vector: r.get::<_, Option<Vec<u8>>>(5)?.map(|b| bytes_to_vector(&b)),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// All chunks visible to a hybrid search, joined with their owning
    /// file's diary and path. `diary = None` searches across every diary.
    pub async fn iter_candidate_chunks(&self, diary: Option<String>) -> Result<Vec<(Chunk, String, String)>> {
        self.query(move |conn| {
            let mut out = Vec::new();
            let mut push_rows = |mut rows: rusqlite::Rows| -> Result<()> {
                while let Some(r) = rows.next()? {
                    let chunk = Chunk {
                        id: r.get(0)?,
                        file_id: r.get(1)?,
                        ordinal: r.get(2)?,
                        text: r.get(3)?,
                        token_count: r.get::<_, i64>(4)? as usize,
                        vector: r.get::<_, Option<Vec<u8>>>(5)?.map(|b| bytes_to_vector(&b)),
                    };
                    let diary: String = r.get(6)?;
                    let path: String = r.get(7)?;
                    out.push((chunk, diary, path));
                }
                Ok(())
            };

            if let Some(diary) = diary {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.file_id, c.ordinal, c.text, c.token_count, c.vector, f.diary, f.path
                     FROM chunks c JOIN files f ON f.id = c.file_id
                     WHERE f.diary = ?1",
                )?;
                let rows = stmt.query(params![diary])?;
                push_rows(rows)?;
            } else {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.file_id, c.ordinal, c.text, c.token_count, c.vector, f.diary, f.path
                     FROM chunks c JOIN files f ON f.id = c.file_id",
                )?;
                let rows = stmt.query([])?;
                push_rows(rows)?;
            }
            Ok(out)
        })
        .await
    }

    // ---- Tag operations ----------------------------------------------------

    pub fn get_or_create_tag(conn: &Connection, name: &str) -> Result<i64> {
        let normalized = name.to_lowercase();
        conn.execute(
            "INSERT INTO tags (name, global_freq) VALUES (?1, 0) ON CONFLICT(name) DO NOTHING",
            params![normalized],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM tags WHERE name = ?1", params![normalized], |r| r.get(0))?;
        Ok(id)
    }

    /// Replace the set of tags attached to `file_id`, recomputing
    /// `global_freq` for every affected tag. Called in the same transaction
    /// as `replace_chunks`.
    pub fn replace_file_tags(conn: &Connection, file_id: i64, tag_ids: &[i64]) -> Result<()> {
        let previous: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT tag_id FROM file_tags WHERE file_id = ?1")?;
            let rows = stmt.query_map(params![file_id], |r| r.get(0))?;
            rows.collect::<std::result::Result<Vec<i64>, _>>()?
        };

        conn.execute("DELETE FROM file_tags WHERE file_id = ?1", params![file_id])?;
        for tag_id in tag_ids {
            conn.execute(
                "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?1, ?2)",
                params![file_id, tag_id],
            )?;
        }

        let mut touched: Vec<i64> = previous;
        touched.extend(tag_ids.iter().copied());
        touched.sort_unstable();
        touched.dedup();
        for tag_id in touched {
            conn.execute(
                "UPDATE tags SET global_freq = (SELECT COUNT(*) FROM file_tags WHERE tag_id = ?1) WHERE id = ?1",
                params![tag_id],
            )?;
        }
        Ok(())
    }

    pub async fn set_tag_vector(&self, tag_id: i64, vector: Vec<f32>) -> Result<()> {
        self.query(move |conn| {
            let bytes = vector_to_bytes(&vector);
            conn.execute("UPDATE tags SET vector = ?1 WHERE id = ?2", params![bytes, tag_id])?;
            Ok(())
        })
        .await
    }

    pub async fn get_tag_vector(&self, tag_id: i64) -> Result<Option<Vec<f32>>> {
        self.query(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row("SELECT vector FROM tags WHERE id = ?1", params![tag_id], |r| r.get(0))
                .optional()?;
            Ok(bytes.map(|b| bytes_to_vector(&b)))
        })
        .await
    }

    pub async fn iter_tags(&self) -> Result<Vec<Tag>> {
        self.query(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, global_freq FROM tags ORDER BY id ASC")?;
            let rows = stmt.query_map([], |r| {
                Ok(Tag {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    global_freq: r.get(2)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn file_tags_for(&self, file_id: i64) -> Result<Vec<i64>> {
        self.query(move |conn| {
            let mut stmt = conn.prepare("SELECT tag_id FROM file_tags WHERE file_id = ?1")?;
            let rows = stmt.query_map(params![file_id], |r| r.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn all_file_tag_edges(&self) -> Result<Vec<(i64, i64)>> {
        self.query(|conn| {
            let mut stmt = conn.prepare("SELECT file_id, tag_id FROM file_tags")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // ---- Key/value (checkpoint, misc bookkeeping) ------------------------

    pub async fn kv_put(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.query(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn kv_get(&self, key: String) -> Result<Option<Vec<u8>>> {
        self.query(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
                .optional()
        })
        .await
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_vector(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Schema for the knowledge base. Entities created in `files`/`chunks`/
/// `tags`/`file_tags` within one write transaction per ingestion batch;
/// the DB remains the source of truth if ANN index mutation fails after
/// commit.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, strftime('%s', 'now'));

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    diary TEXT NOT NULL,
    path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    indexed_at INTEGER NOT NULL,
    UNIQUE(diary, path)
);
CREATE INDEX IF NOT EXISTS idx_files_diary ON files(diary);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    vector BLOB,
    UNIQUE(file_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    global_freq INTEGER NOT NULL DEFAULT 0,
    vector BLOB
);

CREATE TABLE IF NOT EXISTS file_tags (
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (file_id, tag_id)
);
CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_file_tags_tag_file ON file_tags(tag_id, file_id);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

/// Extension trait for optional query results.
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
    fn optional_with_path(self, path: &Path) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn optional_with_path(self, path: &Path) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(KbeError::sqlite_error(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("kb.sqlite")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_then_get_file_round_trips() {
        let (store, _dir) = open_test_store();
        let f = store
            .upsert_file("diaryA".into(), "a.md".into(), "hash1".into(), 100)
            .await
            .unwrap();
        assert_eq!(f.diary, "diaryA");

        let fetched = store.get_file("diaryA".into(), "a.md".into()).await.unwrap().unwrap();
        assert_eq!(fetched.content_hash, "hash1");
    }

    #[tokio::test]
    async fn delete_file_cascades_to_chunks() {
        let (store, _dir) = open_test_store();
        let f = store
            .upsert_file("diaryA".into(), "a.md".into(), "hash1".into(), 100)
            .await
            .unwrap();
        let file_id = f.id;
        store
            .transaction(move |conn| SqliteStore::replace_chunks(conn, file_id, &[(0, "hello".into(), 1, None)]))
            .await
            .unwrap();

        assert_eq!(store.iter_chunks(file_id).await.unwrap().len(), 1);

        store.delete_file("diaryA".into(), "a.md".into()).await.unwrap();
        assert_eq!(store.iter_chunks(file_id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn tag_global_freq_tracks_file_count() {
        let (store, _dir) = open_test_store();
        let f1 = store.upsert_file("d".into(), "a.md".into(), "h1".into(), 1).await.unwrap();
        let f2 = store.upsert_file("d".into(), "b.md".into(), "h2".into(), 1).await.unwrap();

        let tag_id = store
            .transaction(|conn| SqliteStore::get_or_create_tag(conn, "Rust"))
            .await
            .unwrap();

        store
            .transaction(move |conn| SqliteStore::replace_file_tags(conn, f1.id, &[tag_id]))
            .await
            .unwrap();
        store
            .transaction(move |conn| SqliteStore::replace_file_tags(conn, f2.id, &[tag_id]))
            .await
            .unwrap();

        let tags = store.iter_tags().await.unwrap();
        let rust = tags.iter().find(|t| t.name == "rust").unwrap();
        assert_eq!(rust.global_freq, 2);
    }

    #[test]
    fn vector_bytes_round_trip() {
        let v = vec![1.0_f32, -2.5, 3.25];
        let bytes = vector_to_bytes(&v);
        assert_eq!(bytes_to_vector(&bytes), v);
    }
}
