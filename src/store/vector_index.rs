//! In-process HNSW index over chunk embeddings.
//!
//! The index accelerates nearest-neighbor lookups; SQLite rows stay the
//! source of truth. Entries are appended when embeddings are written and
//! never removed — lookups re-read the row, so points whose chunk has been
//! replaced simply fail hydration and drop out of results. Readers and the
//! single writer may overlap; a reader may briefly miss the newest inserts.

use std::sync::atomic::{AtomicUsize, Ordering};

use hnsw_rs::prelude::*;

/// HNSW parameters tuned for recall >= 0.95 at the typical corpus size.
const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const MIN_EF_SEARCH: usize = 64;

/// Capacity hint used for layer sizing.
const EXPECTED_ELEMENTS: usize = 100_000;

/// Approximate-nearest-neighbor index keyed by chunk id, cosine distance.
pub struct VectorIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    dim: usize,
    len: AtomicUsize,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            hnsw: Hnsw::new(
                MAX_NB_CONNECTION,
                EXPECTED_ELEMENTS,
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistCosine {},
            ),
            dim,
            len: AtomicUsize::new(0),
        }
    }

    /// Insert a chunk vector. The caller guarantees the dimension matches.
    pub fn insert(&self, chunk_id: i64, vector: &Vec<f32>) {
        debug_assert_eq!(vector.len(), self.dim);
        self.hnsw.insert((vector, chunk_id as usize));
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Return up to `n` candidate chunk ids with cosine distances
    /// (0 = identical direction), nearest first.
    pub fn search(&self, query: &[f32], n: usize) -> Vec<(i64, f32)> {
        if self.is_empty() || query.len() != self.dim {
            return Vec::new();
        }
        let ef = MIN_EF_SEARCH.max(2 * n);
        let query = query.to_vec();
        self.hnsw
            .search(&query, n, ef)
            .into_iter()
            .map(|neighbour| (neighbour.d_id as i64, neighbour.distance))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
