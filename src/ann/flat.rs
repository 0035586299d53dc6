//! Default `AnnIndex` implementation: exact cosine search over an
//! in-memory flat vector table.
//!
//! Persisted as a small binary format: a magic/version header, dimension,
//! then one record per id `(id: i64, tombstoned: u8, vector: [f32; dim])`.
//! `save` always writes to `<path>.tmp` in the same directory and renames
//! over the destination so a reader never observes a half-written file.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use crate::ann::AnnIndex;
use crate::ann::IndexStats;
use crate::ann::ScoredId;
use crate::error::KbeError;
use crate::error::Result;
use crate::types::cosine;

const MAGIC: &[u8; 4] = b"KBAN";
const VERSION: u32 = 1;

pub struct FlatIndex {
    dim: usize,
    vectors: HashMap<i64, Vec<f32>>,
    tombstones: std::collections::HashSet<i64>,
}

impl AnnIndex for FlatIndex {
    fn create(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
            tombstones: std::collections::HashSet::new(),
        }
    }

    fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(KbeError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        self.tombstones.remove(&id);
        self.vectors.insert(id, vector.to_vec());
        Ok(())
    }

    fn remove(&mut self, id: i64) {
        self.tombstones.insert(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        if query.len() != self.dim {
            return Err(KbeError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let mut scored: Vec<ScoredId> = self
            .vectors
            .iter()
            .filter(|(id, _)| !self.tombstones.contains(*id))
            .map(|(id, v)| ScoredId {
                id: *id,
                score: cosine(query, v),
            })
            .collect();

        // Descending by score, tie-break by ascending id for determinism.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            live_count: self.vectors.len() - self.tombstones.iter().filter(|id| self.vectors.contains_key(id)).count(),
            tombstoned_count: self.tombstones.len(),
            dim: self.dim,
        }
    }

    fn get_vector(&self, id: i64) -> Option<&[f32]> {
        if self.tombstones.contains(&id) {
            return None;
        }
        self.vectors.get(&id).map(|v| v.as_slice())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("ann.tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| KbeError::FileWrite {
                path: tmp_path.clone(),
                cause: e.to_string(),
            })?;
            file.write_all(MAGIC).map_err(io_write_err(&tmp_path))?;
            file.write_all(&VERSION.to_le_bytes()).map_err(io_write_err(&tmp_path))?;
            file.write_all(&(self.dim as u32).to_le_bytes()).map_err(io_write_err(&tmp_path))?;
            file.write_all(&(self.vectors.len() as u64).to_le_bytes())
                .map_err(io_write_err(&tmp_path))?;
            for (id, vector) in &self.vectors {
                file.write_all(&id.to_le_bytes()).map_err(io_write_err(&tmp_path))?;
                let tombstoned: u8 = if self.tombstones.contains(id) { 1 } else { 0 };
                file.write_all(&[tombstoned]).map_err(io_write_err(&tmp_path))?;
                for x in vector {
                    file.write_all(&x.to_le_bytes()).map_err(io_write_err(&tmp_path))?;
                }
            }
            file.sync_all().map_err(io_write_err(&tmp_path))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| KbeError::FileWrite {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let mut file = fs::File::open(path).map_err(|e| KbeError::FileRead {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(|e| KbeError::FileRead {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

        let corrupt = |cause: &str| KbeError::CorruptIndex {
            path: path.to_path_buf(),
            cause: cause.to_string(),
        };

        if buf.len() < 4 + 4 + 4 + 8 {
            return Err(corrupt("file too short"));
        }
        if &buf[0..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut cursor = 4;
        let version = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let dim = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let count = u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap()) as usize;
        cursor += 8;

        let record_size = 8 + 1 + dim * 4;
        if buf.len() < cursor + record_size * count {
            return Err(corrupt("truncated record data"));
        }

        let mut vectors = HashMap::with_capacity(count);
        let mut tombstones = std::collections::HashSet::new();
        for _ in 0..count {
            let id = i64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
            let tombstoned = buf[cursor];
            cursor += 1;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(f32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap()));
                cursor += 4;
            }
            if tombstoned == 1 {
                tombstones.insert(id);
            }
            vectors.insert(id, vector);
        }

        Ok(Self { dim, vectors, tombstones })
    }
}

fn io_write_err(path: &Path) -> impl Fn(std::io::Error) -> KbeError + '_ {
    move |e| KbeError::FileWrite {
        path: path.to_path_buf(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_then_search_finds_closest() {
        let mut idx = FlatIndex::create(2);
        idx.add(1, &[1.0, 0.0]).unwrap();
        idx.add(2, &[0.0, 1.0]).unwrap();
        idx.add(3, &[0.9, 0.1]).unwrap();

        let results = idx.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].id, 1);
        assert_eq!(results[1].id, 3);
    }

    #[test]
    fn removed_id_never_returned() {
        let mut idx = FlatIndex::create(2);
        idx.add(1, &[1.0, 0.0]).unwrap();
        idx.remove(1);
        let results = idx.search(&[1.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn dimension_mismatch_on_add_and_search() {
        let mut idx = FlatIndex::create(3);
        assert!(matches!(idx.add(1, &[1.0, 0.0]), Err(KbeError::DimensionMismatch { .. })));
        idx.add(2, &[1.0, 0.0, 0.0]).unwrap();
        assert!(matches!(idx.search(&[1.0, 0.0], 1), Err(KbeError::DimensionMismatch { .. })));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.ann");

        let mut idx = FlatIndex::create(2);
        idx.add(1, &[1.0, 0.0]).unwrap();
        idx.add(2, &[0.0, 1.0]).unwrap();
        idx.remove(2);
        idx.save(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        let results = loaded.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn load_of_missing_file_is_corrupt_not_panic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.ann");
        assert!(FlatIndex::load(&path).is_err());
    }
}
