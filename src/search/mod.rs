//! Semantic search over stored chunk vectors.
//!
//! Embeds the query once, asks the store's ANN index for candidates and
//! returns user-scoped hits ordered by cosine similarity. Results only ever
//! contain chunks of the caller's own completed jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::embedding::{EmbedError, Embedder};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub job_id: i64,
    pub chunk_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub topic_summary: String,
    /// Cosine similarity in [-1, 1], higher is better.
    pub score: f32,
    pub start_time: f64,
    pub end_time: f64,
    pub created_at: DateTime<Utc>,
}

/// Query-side facade over the store's vector search.
pub struct SearchEngine {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
}

impl SearchEngine {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Top-`k` chunks of `user_id`'s completed jobs for a free-text query.
    pub async fn search(
        &self,
        user_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let query_vec = self.embedder.embed_one(query_text).await?;
        let scored = self.store.search_chunks(user_id, &query_vec, k)?;
        debug!(user_id, k, hits = scored.len(), "semantic search served");

        Ok(scored
            .into_iter()
            .map(|hit| SearchHit {
                job_id: hit.chunk.job_id,
                chunk_id: hit.chunk.id,
                chunk_index: hit.chunk.chunk_index,
                text: hit.chunk.text,
                topic_summary: hit.chunk.topic_summary,
                score: hit.score,
                start_time: hit.chunk.start_time,
                end_time: hit.chunk.end_time,
                created_at: hit.chunk.created_at,
            })
            .collect())
    }
}
