//! Semantic chunks: contiguous, topic-coherent spans of a transcript.
//!
//! The chunker produces [`ChunkDraft`] values; the store assigns ids and
//! the embed stage patches vectors in later. Character positions are UTF-8
//! byte offsets into the job transcript, aligned to char boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chunk as produced by the chunker, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    /// Dense 0-based position within the job, ascending in transcript order.
    pub chunk_index: i64,
    /// Verbatim transcript slice `[start_char_pos, end_char_pos)`.
    pub text: String,
    /// Short topic summary; empty in the sentence fallback.
    pub topic_summary: String,
    /// Ordered keywords; empty in the sentence fallback.
    pub keywords: Vec<String>,
    /// Oracle's self-reported trust in [0, 1]; 0 in the fallback.
    pub confidence: f64,
    /// Seconds into the audio where the chunk's speech starts.
    pub start_time: f64,
    /// Seconds into the audio where the chunk's speech ends.
    pub end_time: f64,
    /// Inclusive start offset into the transcript.
    pub start_char_pos: i64,
    /// Exclusive end offset into the transcript.
    pub end_char_pos: i64,
}

/// A persisted chunk row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub job_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub topic_summary: String,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub start_char_pos: i64,
    pub end_char_pos: i64,
    /// Unit-normalized vector, None until the embed stage runs.
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// Check that drafts tile `transcript_len` bytes without gaps or overlap and
/// carry dense indexes and monotonic times. Returns a description of the
/// first violation.
pub fn validate_drafts(drafts: &[ChunkDraft], transcript_len: usize) -> Result<(), String> {
    if drafts.is_empty() {
        if transcript_len == 0 {
            return Ok(());
        }
        return Err("non-empty transcript produced no chunks".to_string());
    }

    let len = transcript_len as i64;
    let mut prev_end_char = 0i64;
    let mut prev_end_time = 0.0f64;

    for (i, draft) in drafts.iter().enumerate() {
        if draft.chunk_index != i as i64 {
            return Err(format!(
                "chunk {} has index {}, expected dense ascending indexes",
                i, draft.chunk_index
            ));
        }
        if draft.start_char_pos != prev_end_char {
            return Err(format!(
                "chunk {} starts at {} but previous ended at {}",
                i, draft.start_char_pos, prev_end_char
            ));
        }
        if draft.end_char_pos <= draft.start_char_pos || draft.end_char_pos > len {
            return Err(format!(
                "chunk {} has invalid span [{}, {}) for transcript of {} bytes",
                i, draft.start_char_pos, draft.end_char_pos, len
            ));
        }
        if draft.start_time < 0.0 || draft.end_time < draft.start_time {
            return Err(format!(
                "chunk {} has invalid time range [{}, {}]",
                i, draft.start_time, draft.end_time
            ));
        }
        if draft.start_time < prev_end_time {
            return Err(format!(
                "chunk {} starts at {}s before previous chunk ended at {}s",
                i, draft.start_time, prev_end_time
            ));
        }
        if !(0.0..=1.0).contains(&draft.confidence) {
            return Err(format!(
                "chunk {} has confidence {} outside [0, 1]",
                i, draft.confidence
            ));
        }
        prev_end_char = draft.end_char_pos;
        prev_end_time = draft.end_time;
    }

    if prev_end_char != len {
        return Err(format!(
            "chunks end at {} but transcript has {} bytes",
            prev_end_char, len
        ));
    }
    Ok(())
}
