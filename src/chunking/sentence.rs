//! Sentence-boundary splitting for the fallback chunking strategy.
//!
//! Spans are byte offsets into the original text and tile it exactly: each
//! sentence owns its terminator run and any following whitespace, so the
//! next sentence starts where the previous one ends.

/// Split `text` into sentence spans `[(start, end))` covering every byte.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if text.is_empty() {
        return spans;
    }

    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < len {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            // Consume the whole terminator run, then trailing whitespace.
            while i < len && matches!(bytes[i], b'.' | b'!' | b'?') {
                i += 1;
            }
            while i < len && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            spans.push((start, i));
            start = i;
        } else {
            i += 1;
        }
    }

    if start < len {
        spans.push((start, len));
    }
    spans
}

/// Group sentence spans into chunk spans of `per_chunk` sentences each.
pub fn group_spans(spans: &[(usize, usize)], per_chunk: usize) -> Vec<(usize, usize)> {
    let per_chunk = per_chunk.max(1);
    spans
        .chunks(per_chunk)
        .map(|group| (group[0].0, group[group.len() - 1].1))
        .collect()
}
