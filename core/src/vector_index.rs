//! C3 — Vector Index: an in-memory, pre-normalized matrix of all corpus chunks with metadata.
//!
//! The matrix itself is an `ndarray::Array2<f32>`, the same crate `nn_server::Embedding` uses for
//! its own L2-normalization (`nn_server/src/main.rs`). Snapshots are published via a
//! `std::sync::RwLock<Arc<IndexSnapshot>>` swap: readers clone the `Arc` under a brief read lock
//! and then search against their own snapshot with no lock held, so a concurrent reload never
//! blocks a search and a search never observes a half-built matrix (I3).

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, warn};

use crate::chunk::{ChunkMeta, Source};
use crate::corpus::CorpusReader;
use crate::error::{EnrichError, Result};

/// One scored hit (§3, "Retrieval Result").
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub source: Source,
    pub text: String,
    pub meta: ChunkMeta,
    pub score: f32,
}

const NORMALIZE_EPS: f32 = 1e-12;

fn l2_normalize_row(row: &mut [f32]) {
    let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt().max(NORMALIZE_EPS);
    for x in row.iter_mut() {
        *x /= norm;
    }
}

struct Row {
    source: Source,
    text: String,
    meta: ChunkMeta,
}

/// A fully-built, immutable index snapshot. Once published it is never mutated (I1, I2, I3).
struct IndexSnapshot {
    matrix: Array2<f32>,
    rows: Vec<Row>,
    loaded_at: Instant,
}

impl IndexSnapshot {
    fn empty() -> Self {
        Self {
            matrix: Array2::zeros((0, 0)),
            rows: Vec::new(),
            loaded_at: Instant::now(),
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Process-wide singleton (§9): constructed once and shared by reference into the
/// [`crate::assembler::Assembler`].
pub struct VectorIndex {
    readers: Vec<Arc<dyn CorpusReader>>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    stale_after: Duration,
    /// Set by `invalidate()`; consulted (and cleared) by the next `search()` without blocking
    /// the caller that invalidated.
    force_reload: std::sync::atomic::AtomicBool,
}

impl VectorIndex {
    pub fn new(readers: Vec<Arc<dyn CorpusReader>>, stale_after: Duration) -> Self {
        Self {
            readers,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::empty())),
            stale_after,
            force_reload: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Marks the index stale without blocking the caller (§4.3, "Freshness"). The next `search`
    /// reloads.
    pub fn invalidate(&self) {
        self.force_reload
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_stale(&self, snapshot: &IndexSnapshot) -> bool {
        self.force_reload.load(std::sync::atomic::Ordering::SeqCst)
            || snapshot.loaded_at.elapsed() > self.stale_after
    }

    /// Reads every chunk from every configured corpus, builds a fresh row-major matrix,
    /// L2-normalizes every row, and publishes it atomically. A failure here leaves the previous
    /// snapshot intact (§4.3, "Failure semantics").
    async fn reload(&self) -> Result<()> {
        let mut rows = Vec::new();
        let mut flat = Vec::new();
        let mut dim = 0usize;

        for reader in &self.readers {
            let chunks = reader.load_all().await?;
            for chunk in chunks {
                if dim == 0 {
                    dim = chunk.vector.len();
                } else if chunk.vector.len() != dim {
                    return Err(EnrichError::InvalidResponse(format!(
                        "chunk from source {:?} has dimension {}, expected {}",
                        chunk.source,
                        chunk.vector.len(),
                        dim
                    )));
                }
                let mut vector = chunk.vector;
                l2_normalize_row(&mut vector);
                flat.extend_from_slice(&vector);
                rows.push(Row {
                    source: chunk.source,
                    text: chunk.text,
                    meta: chunk.meta,
                });
            }
        }

        let matrix = if rows.is_empty() {
            Array2::zeros((0, 0))
        } else {
            Array2::from_shape_vec((rows.len(), dim), flat)
                .map_err(|e| EnrichError::CacheInvariantViolated(e.to_string()))?
        };

        let snapshot = Arc::new(IndexSnapshot {
            matrix,
            rows,
            loaded_at: Instant::now(),
        });

        debug!(rows = snapshot.len(), "vector index reloaded");
        *self.snapshot.write().expect("snapshot lock poisoned") = snapshot;
        self.force_reload
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn current_snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock poisoned"))
    }

    /// `search(queryVector, topK, minScore, sourceFilter?) -> RetrievalResult` (§4.3).
    pub async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        min_score: f32,
        source_filter: Option<&BTreeSet<Source>>,
    ) -> Result<Vec<RetrievedChunk>> {
        let snapshot = self.current_snapshot();
        if self.is_stale(&snapshot) {
            if let Err(e) = self.reload().await {
                warn!(error = %e, "vector index reload failed, serving previous snapshot");
            }
        }
        let snapshot = self.current_snapshot();

        if top_k == 0 || snapshot.len() == 0 {
            return Ok(Vec::new());
        }

        let mut query = query_vector.to_vec();
        l2_normalize_row(&mut query);

        let mut scored: Vec<(usize, f32)> = snapshot
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let excluded = source_filter.is_some_and(|set| !set.contains(&row.source));
                if excluded {
                    (i, f32::NEG_INFINITY)
                } else {
                    let dot: f32 = snapshot
                        .matrix
                        .row(i)
                        .iter()
                        .zip(query.iter())
                        .map(|(a, b)| a * b)
                        .sum();
                    (i, dot)
                }
            })
            .collect();

        // Partial order by score descending, ties broken by lower index (stable sort preserves
        // original insertion order for equal scores).
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let results = scored
            .into_iter()
            .take(top_k)
            .filter(|(_, score)| *score >= min_score)
            .map(|(i, score)| {
                let row = &snapshot.rows[i];
                RetrievedChunk {
                    source: row.source,
                    text: row.text.clone(),
                    meta: row.meta.clone(),
                    score,
                }
            })
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkMeta};
    use crate::corpus::InMemoryCorpusReader;

    fn chunk(source: Source, text: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            source,
            text: text.to_owned(),
            vector,
            meta: ChunkMeta::Memory {
                file: "f.rs".to_owned(),
                start_line: 1,
                end_line: 1,
            },
        }
    }

    fn index_with(chunks: Vec<Chunk>) -> VectorIndex {
        let reader = Arc::new(InMemoryCorpusReader::new(Source::Memory, chunks));
        VectorIndex::new(vec![reader], Duration::from_secs(60))
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty_not_error() {
        let index = index_with(Vec::new());
        let result = index
            .search(&[1.0, 0.0], 5, 0.0, None)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn top_k_zero_returns_empty() {
        let index = index_with(vec![chunk(Source::Memory, "a", vec![1.0, 0.0])]);
        let result = index.search(&[1.0, 0.0], 0, 0.0, None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn min_score_one_excludes_non_exact_matches() {
        let index = index_with(vec![chunk(Source::Memory, "a", vec![1.0, 1.0])]);
        let result = index.search(&[1.0, 0.0], 5, 1.0, None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn min_score_one_keeps_exact_duplicate() {
        let index = index_with(vec![chunk(Source::Memory, "a", vec![1.0, 0.0])]);
        let result = index.search(&[1.0, 0.0], 5, 1.0, None).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!((result[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn results_are_sorted_descending_by_score() {
        let index = index_with(vec![
            chunk(Source::Memory, "low", vec![0.1, 0.995]),
            chunk(Source::Memory, "high", vec![1.0, 0.0]),
            chunk(Source::Memory, "mid", vec![0.7, 0.7]),
        ]);
        let result = index.search(&[1.0, 0.0], 3, -1.0, None).await.unwrap();
        assert_eq!(result[0].text, "high");
        for pair in result.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn source_filter_excludes_other_sources() {
        let reader_memory = Arc::new(InMemoryCorpusReader::new(
            Source::Memory,
            vec![chunk(Source::Memory, "mem", vec![1.0, 0.0])],
        ));
        let reader_chat = Arc::new(InMemoryCorpusReader::new(
            Source::Chat,
            vec![chunk(Source::Chat, "chat", vec![1.0, 0.0])],
        ));
        let index = VectorIndex::new(vec![reader_memory, reader_chat], Duration::from_secs(60));

        let only_memory = BTreeSet::from([Source::Memory]);
        let result = index
            .search(&[1.0, 0.0], 5, -1.0, Some(&only_memory))
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].source, Source::Memory);
    }

    #[tokio::test]
    async fn rows_are_l2_normalized_on_load() {
        let index = index_with(vec![chunk(Source::Memory, "a", vec![3.0, 4.0])]);
        // Force a load by searching once.
        index.search(&[1.0, 0.0], 1, -1.0, None).await.unwrap();
        let snapshot = index.current_snapshot();
        let row = snapshot.matrix.row(0);
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn invalidate_forces_reload_on_next_search() {
        let index = index_with(vec![chunk(Source::Memory, "a", vec![1.0, 0.0])]);
        index.search(&[1.0, 0.0], 1, -1.0, None).await.unwrap();
        index.invalidate();
        assert!(index.force_reload.load(std::sync::atomic::Ordering::SeqCst));
        index.search(&[1.0, 0.0], 1, -1.0, None).await.unwrap();
        assert!(!index.force_reload.load(std::sync::atomic::Ordering::SeqCst));
    }
}
