//! Flat nearest-neighbor vector index.
//!
//! A brute-force L2 index over embedding rows, persisted as an opaque binary
//! artifact next to a JSON array of the chunk texts it addresses. Row `i` of
//! the index corresponds to chunk `i`; the two artifacts are written and
//! loaded as a unit, and a row-count mismatch is a corrupt-artifact error.
//!
//! Binary layout: 8-byte magic, u32 dims, u32 row count, then rows of
//! little-endian f32 values.

use std::fs;
use std::path::Path;

use crate::error::{RagError, Result};

const INDEX_MAGIC: &[u8; 8] = b"PDFCHIX1";

/// Brute-force Euclidean nearest-neighbor index. Built once per document at
/// ingestion time, read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dims: usize,
    /// Row-major embedding matrix, `rows.len() == row_count * dims`.
    rows: Vec<f32>,
}

impl FlatIndex {
    /// Build an index over `vectors`. Dimension is inferred from the first
    /// vector; every vector must share it.
    pub fn build(vectors: &[Vec<f32>]) -> Result<Self> {
        let first = vectors
            .first()
            .ok_or_else(|| RagError::stage("index build", "no vectors"))?;
        let dims = first.len();
        if dims == 0 {
            return Err(RagError::stage("index build", "zero-dimension vector"));
        }

        let mut rows = Vec::with_capacity(vectors.len() * dims);
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != dims {
                return Err(RagError::stage(
                    "index build",
                    format!("vector {} has {} dims, expected {}", i, v.len(), dims),
                ));
            }
            rows.extend_from_slice(v);
        }

        Ok(Self { dims, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len() / self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Return up to `k` row indices, nearest first by Euclidean distance,
    /// ties broken by lower row index. Fewer than `k` rows returns all.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<usize> {
        if query.len() != self.dims || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = (0..self.len())
            .map(|i| {
                let row = &self.rows[i * self.dims..(i + 1) * self.dims];
                let dist: f32 = row
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (dist, i)
            })
            .collect();

        // Stable ordering: distance, then row index.
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
        scored.truncate(k);
        scored.into_iter().map(|(_, i)| i).collect()
    }

    /// Atomically write the index and its parallel chunk list. Both artifacts
    /// are written via temp-file-then-rename; failure of either leaves no
    /// partially written file behind and fails the operation as a unit.
    pub fn persist(&self, chunks: &[String], index_path: &Path, chunks_path: &Path) -> Result<()> {
        if chunks.len() != self.len() {
            return Err(RagError::stage(
                "persist",
                format!("{} chunks but {} index rows", chunks.len(), self.len()),
            ));
        }

        let mut bytes = Vec::with_capacity(16 + self.rows.len() * 4);
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for v in &self.rows {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let chunks_json = serde_json::to_vec(chunks)
            .map_err(|e| RagError::stage("persist", e.to_string()))?;

        write_atomic(index_path, &bytes)?;
        write_atomic(chunks_path, &chunks_json)?;
        Ok(())
    }

    /// Load the index and chunk list together. Either file missing is
    /// `NotFound`; unreadable content or a row-count mismatch is
    /// `CorruptArtifact`.
    pub fn load(index_path: &Path, chunks_path: &Path) -> Result<(Self, Vec<String>)> {
        let index_bytes = read_artifact(index_path)?;
        let chunks_bytes = read_artifact(chunks_path)?;

        let index = Self::decode(&index_bytes)?;
        let chunks: Vec<String> = serde_json::from_slice(&chunks_bytes)
            .map_err(|e| RagError::CorruptArtifact(format!("chunks JSON: {}", e)))?;

        if chunks.len() != index.len() {
            return Err(RagError::CorruptArtifact(format!(
                "{} chunks but {} index rows",
                chunks.len(),
                index.len()
            )));
        }

        Ok((index, chunks))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 || &bytes[..8] != INDEX_MAGIC {
            return Err(RagError::CorruptArtifact("bad index header".to_string()));
        }
        let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let count = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let body = &bytes[16..];

        let expected = dims
            .checked_mul(count)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| RagError::CorruptArtifact("index header overflow".to_string()))?;
        if dims == 0 || body.len() != expected {
            return Err(RagError::CorruptArtifact(format!(
                "index body is {} bytes, expected {}",
                body.len(),
                expected
            )));
        }

        let rows: Vec<f32> = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self { dims, rows })
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RagError::NotFound(format!("artifact {}", path.display())))
        }
        Err(e) => Err(RagError::CorruptArtifact(format!(
            "{}: {}",
            path.display(),
            e
        ))),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vectors() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.5, 0.5, 0.0],
        ]
    }

    #[test]
    fn build_rejects_empty_and_mismatched() {
        assert!(FlatIndex::build(&[]).is_err());
        assert!(FlatIndex::build(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn self_match_returns_own_row() {
        let vectors = sample_vectors();
        let index = FlatIndex::build(&vectors).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(index.search(v, 1), vec![i]);
        }
    }

    #[test]
    fn search_orders_nearest_first() {
        let index = FlatIndex::build(&sample_vectors()).unwrap();
        let results = index.search(&[0.9, 0.1, 0.0], 4);
        assert_eq!(results[0], 0);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn k_larger_than_index_returns_all() {
        let index = FlatIndex::build(&sample_vectors()).unwrap();
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 100).len(), 4);
    }

    #[test]
    fn equal_distances_break_ties_by_row_index() {
        let index = FlatIndex::build(&[
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ])
        .unwrap();
        // Rows 0 and 2 are identical; 0 must come first.
        assert_eq!(index.search(&[1.0, 0.0], 3), vec![0, 2, 1]);
    }

    #[test]
    fn dimension_mismatch_query_returns_empty() {
        let index = FlatIndex::build(&sample_vectors()).unwrap();
        assert!(index.search(&[1.0, 0.0], 3).is_empty());
    }

    #[test]
    fn persist_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("doc.index");
        let chunks_path = tmp.path().join("doc.json");

        let vectors = sample_vectors();
        let chunks: Vec<String> = (0..4).map(|i| format!("chunk {}", i)).collect();
        let index = FlatIndex::build(&vectors).unwrap();
        index.persist(&chunks, &index_path, &chunks_path).unwrap();

        let (loaded, loaded_chunks) = FlatIndex::load(&index_path, &chunks_path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded_chunks, chunks);
        assert_eq!(loaded.len(), loaded_chunks.len());
    }

    #[test]
    fn load_fails_as_unit_if_either_artifact_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("doc.index");
        let chunks_path = tmp.path().join("doc.json");

        let index = FlatIndex::build(&sample_vectors()).unwrap();
        let chunks: Vec<String> = (0..4).map(|i| format!("chunk {}", i)).collect();
        index.persist(&chunks, &index_path, &chunks_path).unwrap();

        std::fs::remove_file(&chunks_path).unwrap();
        assert!(matches!(
            FlatIndex::load(&index_path, &chunks_path),
            Err(RagError::NotFound(_))
        ));
    }

    #[test]
    fn row_count_mismatch_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("doc.index");
        let chunks_path = tmp.path().join("doc.json");

        let index = FlatIndex::build(&sample_vectors()).unwrap();
        let chunks: Vec<String> = (0..4).map(|i| format!("chunk {}", i)).collect();
        index.persist(&chunks, &index_path, &chunks_path).unwrap();

        // Rewrite chunks with a different length.
        std::fs::write(&chunks_path, serde_json::to_vec(&["only one"]).unwrap()).unwrap();
        assert!(matches!(
            FlatIndex::load(&index_path, &chunks_path),
            Err(RagError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn garbage_index_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let index_path = tmp.path().join("doc.index");
        let chunks_path = tmp.path().join("doc.json");
        std::fs::write(&index_path, b"not an index").unwrap();
        std::fs::write(&chunks_path, b"[]").unwrap();
        assert!(matches!(
            FlatIndex::load(&index_path, &chunks_path),
            Err(RagError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn persist_rejects_misaligned_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FlatIndex::build(&sample_vectors()).unwrap();
        let too_few = vec!["a".to_string()];
        assert!(index
            .persist(
                &too_few,
                &tmp.path().join("i.index"),
                &tmp.path().join("c.json")
            )
            .is_err());
    }
}
