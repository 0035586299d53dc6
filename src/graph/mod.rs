//! The Tag Graph: a derived, in-memory co-occurrence matrix over tags,
//! rebuilt asynchronously from `file_tags` after every ingestion batch and
//! published to readers via an atomic snapshot swap so no reader ever
//! observes a half-rebuilt graph.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::store::SqliteStore;

/// Co-occurrence weight between two tags: the number of files that carry
/// both. Symmetric; `(a, b)` and `(b, a)` are both stored for O(1)
/// neighbor lookup.
#[derive(Debug, Clone, Default)]
pub struct TagGraphSnapshot {
    neighbors: HashMap<i64, Vec<(i64, u32)>>,
}

impl TagGraphSnapshot {
    pub fn neighbors_of(&self, tag_id: i64) -> &[(i64, u32)] {
        self.neighbors.get(&tag_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

pub struct TagGraph {
    current: ArcSwap<TagGraphSnapshot>,
}

impl Default for TagGraph {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(TagGraphSnapshot::default()),
        }
    }
}

impl TagGraph {
    pub fn snapshot(&self) -> Arc<TagGraphSnapshot> {
        self.current.load_full()
    }

    /// Recompute the full co-occurrence matrix from `file_tags` and swap it
    /// in atomically. Equivalent to:
    ///   SELECT a.tag_id, b.tag_id, COUNT(*)
    ///   FROM file_tags a JOIN file_tags b
    ///     ON a.file_id = b.file_id AND a.tag_id <> b.tag_id
    ///   GROUP BY a.tag_id, b.tag_id
    pub async fn rebuild(&self, store: &SqliteStore) -> crate::error::Result<()> {
        let edges = store.all_file_tag_edges().await?;

        let mut by_file: HashMap<i64, Vec<i64>> = HashMap::new();
        for (file_id, tag_id) in edges {
            by_file.entry(file_id).or_default().push(tag_id);
        }

        let mut counts: HashMap<(i64, i64), u32> = HashMap::new();
        for tags in by_file.values() {
            for &a in tags {
                for &b in tags {
                    if a != b {
                        *counts.entry((a, b)).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut neighbors: HashMap<i64, Vec<(i64, u32)>> = HashMap::new();
        for ((a, b), weight) in counts {
            neighbors.entry(a).or_default().push((b, weight));
        }
        for list in neighbors.values_mut() {
            list.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
        }

        self.current.store(Arc::new(TagGraphSnapshot { neighbors }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn cooccurrence_counts_shared_files() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("kb.sqlite")).unwrap();

        let f1 = store.upsert_file("d".into(), "a.md".into(), "h1".into(), 1).await.unwrap();
        let f2 = store.upsert_file("d".into(), "b.md".into(), "h2".into(), 1).await.unwrap();

        let (t1, t2, t3) = store
            .transaction(|conn| {
                let t1 = crate::store::SqliteStore::get_or_create_tag(conn, "rust")?;
                let t2 = crate::store::SqliteStore::get_or_create_tag(conn, "async")?;
                let t3 = crate::store::SqliteStore::get_or_create_tag(conn, "solo")?;
                Ok((t1, t2, t3))
            })
            .await
            .unwrap();

        store
            .transaction(move |conn| crate::store::SqliteStore::replace_file_tags(conn, f1.id, &[t1, t2]))
            .await
            .unwrap();
        store
            .transaction(move |conn| crate::store::SqliteStore::replace_file_tags(conn, f2.id, &[t1, t3]))
            .await
            .unwrap();

        let graph = TagGraph::default();
        graph.rebuild(&store).await.unwrap();
        let snap = graph.snapshot();

        let rust_neighbors = snap.neighbors_of(t1);
        assert!(rust_neighbors.iter().any(|(id, w)| *id == t2 && *w == 1));
        assert!(rust_neighbors.iter().any(|(id, w)| *id == t3 && *w == 1));
        assert!(snap.neighbors_of(t2).iter().all(|(id, _)| *id != t3));
    }

    #[tokio::test]
    async fn empty_store_yields_empty_graph() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("kb.sqlite")).unwrap();
        let graph = TagGraph::default();
        graph.rebuild(&store).await.unwrap();
        assert!(graph.snapshot().is_empty());
    }
}
