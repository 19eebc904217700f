//! Topic oracle: an LLM collaborator that proposes a topic-coherent
//! partition of a transcript.
//!
//! The HTTP implementation speaks the OpenAI-compatible chat-completions
//! API (Ollama, vLLM and friends). Model output is treated as hostile
//! input: think-tags are stripped, the JSON object is dug out of whatever
//! prose surrounds it, and everything else is the caller's problem to
//! validate.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// One proposed span, character positions into the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSpan {
    pub start_char_pos: usize,
    pub end_char_pos: usize,
    pub topic_summary: String,
    pub keywords: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Http(String),

    #[error("oracle returned malformed output: {0}")]
    Malformed(String),
}

/// Proposes a topic-coherent partition of a transcript.
#[async_trait]
pub trait TopicOracle: Send + Sync {
    async fn suggest_chunks(&self, transcript: &str) -> Result<Vec<TopicSpan>, OracleError>;
}

/// Chat-completions client for the topic oracle.
pub struct HttpTopicOracle {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// The oracle's JSON payload, as prompted for.
#[derive(Debug, Deserialize)]
struct OracleChunks {
    chunks: Vec<OracleChunk>,
}

#[derive(Debug, Deserialize)]
struct OracleChunk {
    start_pos: i64,
    end_pos: i64,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

const SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes transcripts and returns \
                             structured JSON output. Return ONLY valid JSON with no markdown \
                             formatting, no code blocks, and no additional explanation.";

impl HttpTopicOracle {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn build_prompt(transcript: &str) -> String {
        format!(
            "Analyze this transcript and identify topic boundaries for semantic chunking.\n\n\
             Transcript:\n{transcript}\n\n\
             For each topic segment provide:\n\
             - start_pos: character position where the topic starts (integer)\n\
             - end_pos: character position where the topic ends (integer)\n\
             - topic: 1-2 sentence summary of the topic\n\
             - keywords: 3-5 most important keywords (array of strings)\n\
             - confidence: your confidence in this boundary (0.0-1.0)\n\n\
             Return ONLY valid JSON in this exact format:\n\
             {{\"chunks\": [{{\"start_pos\": 0, \"end_pos\": 120, \"topic\": \"...\", \
             \"keywords\": [\"...\"], \"confidence\": 0.9}}]}}\n\n\
             Rules:\n\
             - Cover ALL content: the first chunk starts at 0, the last ends at {len}\n\
             - No gaps and no overlap: each chunk's start_pos equals the previous end_pos\n\
             - Return pure JSON only",
            transcript = transcript,
            len = transcript.len(),
        )
    }
}

#[async_trait]
impl TopicOracle for HttpTopicOracle {
    async fn suggest_chunks(&self, transcript: &str) -> Result<Vec<TopicSpan>, OracleError> {
        let prompt = Self::build_prompt(transcript);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 4000,
            stream: false,
        };

        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| OracleError::Http(e.to_string()))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("bad chat response: {e}")))?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        debug!(chars = content.len(), "oracle response received");

        parse_oracle_content(content)
    }
}

/// Parse the model's free-text answer into spans.
pub fn parse_oracle_content(content: &str) -> Result<Vec<TopicSpan>, OracleError> {
    let cleaned = strip_think_tags(content);
    let json = extract_json_object(&cleaned)
        .ok_or_else(|| OracleError::Malformed("no JSON object in response".to_string()))?;

    let parsed: OracleChunks = serde_json::from_str(json)
        .map_err(|e| OracleError::Malformed(format!("unparseable chunk JSON: {e}")))?;
    if parsed.chunks.is_empty() {
        return Err(OracleError::Malformed("empty chunk list".to_string()));
    }

    let mut spans = Vec::with_capacity(parsed.chunks.len());
    for chunk in parsed.chunks {
        if chunk.start_pos < 0 || chunk.end_pos < 0 {
            return Err(OracleError::Malformed(format!(
                "negative position in span [{}, {})",
                chunk.start_pos, chunk.end_pos
            )));
        }
        spans.push(TopicSpan {
            start_char_pos: chunk.start_pos as usize,
            end_char_pos: chunk.end_pos as usize,
            topic_summary: chunk.topic.trim().to_string(),
            keywords: chunk.keywords,
            confidence: chunk.confidence,
        });
    }
    Ok(spans)
}

/// Remove `<think>...</think>` style blocks some models emit before the
/// actual answer.
fn strip_think_tags(content: &str) -> String {
    let mut out = content.to_string();
    for tag in ["think", "thinking"] {
        loop {
            let lower = out.to_lowercase();
            let open = format!("<{tag}>");
            let close = format!("</{tag}>");
            let Some(start) = lower.find(&open) else { break };
            let Some(end_rel) = lower[start..].find(&close) else {
                break;
            };
            out.replace_range(start..start + end_rel + close.len(), "");
        }
    }
    out
}

/// Slice out the outermost `{ ... }` object, tolerating surrounding prose.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_clean_response() {
        let content = r#"{"chunks": [
            {"start_pos": 0, "end_pos": 13, "topic": "Greeting", "keywords": ["hello"], "confidence": 0.9},
            {"start_pos": 13, "end_pos": 28, "topic": "Testing", "keywords": ["test"], "confidence": 0.8}
        ]}"#;
        let spans = parse_oracle_content(content).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start_char_pos, 0);
        assert_eq!(spans[0].end_char_pos, 13);
        assert_eq!(spans[1].topic_summary, "Testing");
    }

    #[test]
    fn digs_json_out_of_prose_and_think_tags() {
        let content = "<think>Let me partition this...</think>\nHere you go:\n\
                       {\"chunks\": [{\"start_pos\": 0, \"end_pos\": 10, \"topic\": \"t\", \
                       \"keywords\": [], \"confidence\": 1.0}]}\nHope that helps!";
        let spans = parse_oracle_content(content).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end_char_pos, 10);
    }

    #[test]
    fn rejects_responses_without_json() {
        assert!(parse_oracle_content("I cannot help with that.").is_err());
        assert!(parse_oracle_content("").is_err());
    }

    #[test]
    fn rejects_empty_and_negative_spans() {
        assert!(parse_oracle_content(r#"{"chunks": []}"#).is_err());
        let negative = r#"{"chunks": [{"start_pos": -5, "end_pos": 10}]}"#;
        assert!(parse_oracle_content(negative).is_err());
    }
}
