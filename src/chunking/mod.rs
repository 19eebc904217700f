//! Semantic chunking: transcript + segments in, ordered topic-coherent
//! chunks out.
//!
//! The primary strategy asks the topic oracle for a partition and
//! validates it hard — spans must tile the transcript, minor gaps are
//! repaired by extending the earlier span, anything else is malformed.
//! After bounded oracle attempts the chunker degrades to sentence-based
//! splitting, which always satisfies the same layout invariants.

pub mod oracle;
pub mod sentence;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ChunkingStrategy;
use crate::domain::chunk::validate_drafts;
use crate::domain::{ChunkDraft, Segment};
use crate::error::ActivityError;

pub use oracle::{HttpTopicOracle, OracleError, TopicOracle, TopicSpan};

/// Oracle calls before degrading to the sentence fallback.
const ORACLE_ATTEMPTS: usize = 2;

/// Keywords are capped at this many entries per chunk.
const MAX_KEYWORDS: usize = 7;

#[derive(Debug, Error)]
pub enum ChunkError {
    /// Even the fallback produced an invalid layout; indicates a bug or
    /// corrupted transcript and is not retriable.
    #[error("invalid chunk layout: {0}")]
    Invalid(String),
}

impl From<ChunkError> for ActivityError {
    fn from(err: ChunkError) -> Self {
        ActivityError::permanent(err.to_string())
    }
}

/// Splits transcripts into chunks, preferring the topic oracle.
pub struct Chunker {
    oracle: Option<Arc<dyn TopicOracle>>,
    strategy: ChunkingStrategy,
    sentences_per_chunk: usize,
}

impl Chunker {
    pub fn new(
        oracle: Option<Arc<dyn TopicOracle>>,
        strategy: ChunkingStrategy,
        sentences_per_chunk: usize,
    ) -> Self {
        Self {
            oracle,
            strategy,
            sentences_per_chunk: sentences_per_chunk.max(1),
        }
    }

    /// Produce the ordered chunk set for a transcript. A zero-length
    /// transcript yields zero chunks.
    pub async fn chunk(
        &self,
        transcript: &str,
        segments: &[Segment],
    ) -> Result<Vec<ChunkDraft>, ChunkError> {
        if transcript.is_empty() {
            return Ok(Vec::new());
        }

        if self.strategy == ChunkingStrategy::Semantic {
            if let Some(oracle) = &self.oracle {
                for attempt in 1..=ORACLE_ATTEMPTS {
                    match oracle.suggest_chunks(transcript).await {
                        Ok(spans) => match semantic_drafts(transcript, segments, spans) {
                            Ok(drafts) => {
                                debug!(chunks = drafts.len(), attempt, "oracle partition accepted");
                                return Ok(drafts);
                            }
                            Err(reason) => {
                                warn!(attempt, %reason, "oracle partition rejected");
                            }
                        },
                        Err(e) => {
                            warn!(attempt, error = %e, "oracle call failed");
                        }
                    }
                }
                info!("topic oracle exhausted, using sentence fallback");
            }
        }

        let drafts = fallback_drafts(transcript, segments, self.sentences_per_chunk);
        validate_drafts(&drafts, transcript.len()).map_err(ChunkError::Invalid)?;
        Ok(drafts)
    }
}

/// Turn validated oracle spans into drafts, or explain why they are
/// unusable.
fn semantic_drafts(
    transcript: &str,
    segments: &[Segment],
    mut spans: Vec<TopicSpan>,
) -> Result<Vec<ChunkDraft>, String> {
    if spans.is_empty() {
        return Err("oracle returned no spans".to_string());
    }
    spans.sort_by_key(|s| (s.start_char_pos, s.end_char_pos));

    let len = transcript.len();
    spans.first_mut().unwrap().start_char_pos = 0;
    spans.last_mut().unwrap().end_char_pos = len;

    for i in 1..spans.len() {
        let prev_end = spans[i - 1].end_char_pos;
        let cur_start = spans[i].start_char_pos;
        if prev_end < cur_start {
            // Minor gap: extend the earlier span up to the next start.
            spans[i - 1].end_char_pos = cur_start;
        } else if prev_end > cur_start {
            return Err(format!(
                "spans overlap: previous ends at {prev_end}, next starts at {cur_start}"
            ));
        }
    }

    for span in &spans {
        if span.end_char_pos > len {
            return Err(format!(
                "span end {} beyond transcript length {len}",
                span.end_char_pos
            ));
        }
        if span.start_char_pos >= span.end_char_pos {
            return Err(format!(
                "empty span [{}, {})",
                span.start_char_pos, span.end_char_pos
            ));
        }
        if !transcript.is_char_boundary(span.start_char_pos)
            || !transcript.is_char_boundary(span.end_char_pos)
        {
            return Err(format!(
                "span [{}, {}) splits a UTF-8 code point",
                span.start_char_pos, span.end_char_pos
            ));
        }
    }

    let seg_spans = segment_char_spans(transcript, segments);
    let mut drafts = Vec::with_capacity(spans.len());
    let mut prev_end_time = 0.0f64;
    for (i, span) in spans.iter().enumerate() {
        let (start_time, end_time) = times_for_span(
            (span.start_char_pos, span.end_char_pos),
            &seg_spans,
            segments,
            prev_end_time,
        );
        prev_end_time = end_time;

        let mut keywords = span.keywords.clone();
        keywords.truncate(MAX_KEYWORDS);

        drafts.push(ChunkDraft {
            chunk_index: i as i64,
            text: transcript[span.start_char_pos..span.end_char_pos].to_string(),
            topic_summary: span.topic_summary.clone(),
            keywords,
            confidence: span.confidence.clamp(0.0, 1.0),
            start_time,
            end_time,
            start_char_pos: span.start_char_pos as i64,
            end_char_pos: span.end_char_pos as i64,
        });
    }

    validate_drafts(&drafts, len)?;
    Ok(drafts)
}

/// Sentence-based chunking; always produces a valid tiling.
fn fallback_drafts(
    transcript: &str,
    segments: &[Segment],
    sentences_per_chunk: usize,
) -> Vec<ChunkDraft> {
    let sentences = sentence::sentence_spans(transcript);
    let chunk_spans = sentence::group_spans(&sentences, sentences_per_chunk);
    let seg_spans = segment_char_spans(transcript, segments);

    let mut drafts = Vec::with_capacity(chunk_spans.len());
    let mut prev_end_time = 0.0f64;
    for (i, &(start, end)) in chunk_spans.iter().enumerate() {
        let (start_time, end_time) = times_for_span((start, end), &seg_spans, segments, prev_end_time);
        prev_end_time = end_time;

        drafts.push(ChunkDraft {
            chunk_index: i as i64,
            text: transcript[start..end].to_string(),
            topic_summary: String::new(),
            keywords: Vec::new(),
            confidence: 0.0,
            start_time,
            end_time,
            start_char_pos: start as i64,
            end_char_pos: end as i64,
        });
    }
    drafts
}

/// Locate each segment's text in the transcript, scanning forward from a
/// cursor. Segments that cannot be located get an empty span and never
/// overlap any chunk.
fn segment_char_spans(transcript: &str, segments: &[Segment]) -> Vec<(usize, usize)> {
    let mut spans = Vec::with_capacity(segments.len());
    let mut cursor = 0usize;
    for segment in segments {
        let needle = segment.text.trim();
        if needle.is_empty() {
            spans.push((cursor, cursor));
            continue;
        }
        match transcript[cursor.min(transcript.len())..].find(needle) {
            Some(rel) => {
                let start = cursor + rel;
                let end = start + needle.len();
                spans.push((start, end));
                cursor = end;
            }
            None => spans.push((cursor, cursor)),
        }
    }
    spans
}

/// Map a chunk's char span onto segment times: start of the earliest
/// overlapping segment, end of the latest. Without any overlap the chunk
/// inherits `prev_end_time` for both bounds.
fn times_for_span(
    span: (usize, usize),
    seg_spans: &[(usize, usize)],
    segments: &[Segment],
    prev_end_time: f64,
) -> (f64, f64) {
    let (start, end) = span;
    let mut start_time = None;
    let mut end_time = None;
    for (seg, &(seg_start, seg_end)) in segments.iter().zip(seg_spans) {
        let overlaps = seg_start < end && start < seg_end;
        if overlaps {
            if start_time.is_none() {
                start_time = Some(seg.start);
            }
            end_time = Some(seg.end);
        }
    }
    match (start_time, end_time) {
        (Some(s), Some(e)) => (s, e),
        _ => (prev_end_time, prev_end_time),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRANSCRIPT: &str = "Hello world. This is a test.";

    fn segments() -> Vec<Segment> {
        vec![
            Segment {
                start: 0.0,
                end: 1.0,
                text: "Hello world.".to_string(),
            },
            Segment {
                start: 1.0,
                end: 2.5,
                text: " This is a test.".to_string(),
            },
        ]
    }

    struct ScriptedOracle {
        spans: Vec<TopicSpan>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopicOracle for ScriptedOracle {
        async fn suggest_chunks(&self, _transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.spans.clone())
        }
    }

    struct FailingOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopicOracle for FailingOracle {
        async fn suggest_chunks(&self, _transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Http("connection refused".to_string()))
        }
    }

    fn span(range: (usize, usize), topic: &str, confidence: f64) -> TopicSpan {
        TopicSpan {
            start_char_pos: range.0,
            end_char_pos: range.1,
            topic_summary: topic.to_string(),
            keywords: vec!["k1".into(), "k2".into(), "k3".into()],
            confidence,
        }
    }

    #[tokio::test]
    async fn oracle_partition_becomes_chunks_with_times() {
        let oracle = Arc::new(ScriptedOracle {
            spans: vec![span((0, 13), "Greeting", 0.9), span((13, 28), "Testing", 0.9)],
            calls: AtomicUsize::new(0),
        });
        let chunker = Chunker::new(Some(oracle.clone()), ChunkingStrategy::Semantic, 4);
        let drafts = chunker.chunk(TRANSCRIPT, &segments()).await.unwrap();

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].text, "Hello world. ");
        assert_eq!(
            (drafts[0].start_char_pos, drafts[0].end_char_pos),
            (0, 13)
        );
        assert_eq!((drafts[0].start_time, drafts[0].end_time), (0.0, 1.0));
        assert_eq!((drafts[1].start_time, drafts[1].end_time), (1.0, 2.5));
        assert_eq!(drafts[1].topic_summary, "Testing");
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oracle_gap_is_repaired() {
        // [0, 10) then [12, 28): the two-byte gap is absorbed by the first span.
        let oracle = Arc::new(ScriptedOracle {
            spans: vec![span((0, 10), "a", 0.8), span((12, 28), "b", 0.8)],
            calls: AtomicUsize::new(0),
        });
        let chunker = Chunker::new(Some(oracle), ChunkingStrategy::Semantic, 4);
        let drafts = chunker.chunk(TRANSCRIPT, &segments()).await.unwrap();

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].end_char_pos, 12);
        assert_eq!(drafts[1].start_char_pos, 12);
    }

    #[tokio::test]
    async fn overlapping_oracle_output_falls_back_after_retries() {
        let oracle = Arc::new(ScriptedOracle {
            spans: vec![span((0, 20), "a", 0.8), span((13, 28), "b", 0.8)],
            calls: AtomicUsize::new(0),
        });
        let chunker = Chunker::new(Some(oracle.clone()), ChunkingStrategy::Semantic, 4);
        let drafts = chunker.chunk(TRANSCRIPT, &segments()).await.unwrap();

        assert_eq!(oracle.calls.load(Ordering::SeqCst), ORACLE_ATTEMPTS);
        // Fallback shape: no summaries, no keywords, zero confidence.
        assert!(drafts.iter().all(|d| d.topic_summary.is_empty()));
        assert!(drafts.iter().all(|d| d.keywords.is_empty()));
        assert!(drafts.iter().all(|d| d.confidence == 0.0));
    }

    #[tokio::test]
    async fn unreachable_oracle_falls_back_to_sentences() {
        let oracle = Arc::new(FailingOracle {
            calls: AtomicUsize::new(0),
        });
        let chunker = Chunker::new(Some(oracle.clone()), ChunkingStrategy::Semantic, 1);
        let drafts = chunker.chunk(TRANSCRIPT, &segments()).await.unwrap();

        assert_eq!(oracle.calls.load(Ordering::SeqCst), ORACLE_ATTEMPTS);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].text, "Hello world. ");
        assert_eq!((drafts[1].start_time, drafts[1].end_time), (1.0, 2.5));
    }

    #[tokio::test]
    async fn sentence_strategy_never_contacts_the_oracle() {
        let oracle = Arc::new(FailingOracle {
            calls: AtomicUsize::new(0),
        });
        let chunker = Chunker::new(Some(oracle.clone()), ChunkingStrategy::Sentence, 4);
        let drafts = chunker.chunk(TRANSCRIPT, &segments()).await.unwrap();

        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].end_char_pos as usize, TRANSCRIPT.len());
    }

    #[tokio::test]
    async fn empty_transcript_yields_no_chunks() {
        let chunker = Chunker::new(None, ChunkingStrategy::Semantic, 4);
        let drafts = chunker.chunk("", &[]).await.unwrap();
        assert!(drafts.is_empty());
    }

    #[tokio::test]
    async fn single_segment_covers_whole_transcript() {
        let transcript = "Just one thought here";
        let segs = vec![Segment {
            start: 0.5,
            end: 4.2,
            text: transcript.to_string(),
        }];
        let chunker = Chunker::new(None, ChunkingStrategy::Sentence, 4);
        let drafts = chunker.chunk(transcript, &segs).await.unwrap();

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, transcript);
        assert_eq!((drafts[0].start_time, drafts[0].end_time), (0.5, 4.2));
    }

    #[test]
    fn unmatched_span_inherits_previous_end_time() {
        let seg_spans = vec![(0usize, 5usize)];
        let segs = vec![Segment {
            start: 2.0,
            end: 3.0,
            text: "hello".to_string(),
        }];
        // Span entirely past the only segment.
        let (s, e) = times_for_span((10, 20), &seg_spans, &segs, 3.0);
        assert_eq!((s, e), (3.0, 3.0));
    }
}
