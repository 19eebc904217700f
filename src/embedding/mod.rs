//! Text embedding: the seam between the pipeline and whatever model
//! produces vectors.
//!
//! The pipeline fixes the dimension at startup and requires unit-normalized
//! output; beyond that it is agnostic to the backing model. The default
//! [`HashingEmbedder`] is a deterministic signed-random-projection scheme —
//! a pure function of `(model_id, text)` — which keeps the whole pipeline
//! runnable and testable without model weights. GPU or HTTP-backed models
//! implement the same trait.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ActivityError;

/// Maximum number of texts sent through the backend in one call.
const MAX_BATCH: usize = 32;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The backing model failed; retriable.
    #[error("embedding backend error: {0}")]
    Backend(String),

    /// The backend returned vectors of the wrong dimension; a
    /// configuration error, not retriable.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<EmbedError> for ActivityError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::Backend(_) => ActivityError::transient(err.to_string()),
            EmbedError::DimensionMismatch { .. } => ActivityError::permanent(err.to_string()),
        }
    }
}

/// A deterministic text-to-unit-vector mapping.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the backing model; part of the embedding's identity.
    fn model_id(&self) -> &str;

    /// Output dimension of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embed up to [`MAX_BATCH`] texts. Output order matches input order.
    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Embed any number of texts, batching internally.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let vectors = self.embed_raw(batch).await?;
            for vector in &vectors {
                if vector.len() != self.dimension() {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.dimension(),
                        got: vector.len(),
                    });
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        Ok(vectors.into_iter().next().unwrap_or_default())
    }
}

/// Signed-random-projection embedder: every word token maps to a
/// deterministic ±1 sign pattern over all dimensions (derived from SHA-256
/// of `(model_id, token)`), token patterns are summed and the result
/// L2-normalized. Shared vocabulary between two texts pulls their vectors
/// together; disjoint vocabulary averages out to near-zero similarity.
///
/// Empty or whitespace-only text maps to the fixed unit vector `e0`
/// (1 in slot zero) so the unit-norm invariant holds for every output.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Add the token's sign pattern into the accumulator.
    fn accumulate(&self, acc: &mut [f32], token: &str) {
        let mut seed = Sha256::new();
        seed.update(self.model_id().as_bytes());
        seed.update([0x1f]);
        seed.update(token.as_bytes());
        let seed = seed.finalize();

        let mut dim = 0usize;
        let mut block = 0u32;
        while dim < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(block.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest.iter() {
                for bit in 0..8 {
                    if dim >= self.dim {
                        return;
                    }
                    acc[dim] += if (byte >> bit) & 1 == 0 { 1.0 } else { -1.0 };
                    dim += 1;
                }
            }
            block += 1;
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dim];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            self.accumulate(&mut acc, &token.to_lowercase());
            tokens += 1;
        }

        if tokens == 0 {
            acc[0] = 1.0;
            return acc;
        }
        let norm = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            acc[0] = 1.0;
            return acc;
        }
        for x in &mut acc {
            *x /= norm;
        }
        acc
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        "signed-projection-v1"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
