//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary and parses its JSON output. The
//! binary writes `<stem>.json` into a temp directory; we read it back and
//! map the segments into the domain shape.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::domain::Segment;

use super::{ModelSize, TranscribeError, TranscribeOptions, Transcriber, Transcription};

/// Subprocess-based whisper transcriber.
pub struct WhisperTranscriber {
    binary_path: String,
}

/// Whisper output JSON structure.
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

impl WhisperTranscriber {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    async fn run_whisper(
        &self,
        audio_path: &Path,
        model: ModelSize,
        language: Option<&str>,
        output_dir: &Path,
    ) -> Result<(), TranscribeError> {
        let mut command = Command::new(&self.binary_path);
        command
            .arg(audio_path)
            .arg("--model")
            .arg(model.as_str())
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--output_format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(language) = language {
            command.arg("--language").arg(language);
        }

        let output = command
            .output()
            .await
            .map_err(|e| TranscribeError::Model(format!("failed to run whisper: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!(
                "whisper exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            // Whisper reports unreadable input through ffmpeg on stderr.
            if stderr.contains("Invalid data") || stderr.contains("could not be decoded") {
                return Err(TranscribeError::Decode(message));
            }
            return Err(TranscribeError::Model(message));
        }
        Ok(())
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError> {
        if !audio_path.exists() {
            return Err(TranscribeError::FileMissing(
                audio_path.display().to_string(),
            ));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| TranscribeError::Model(format!("failed to create temp dir: {e}")))?;
        self.run_whisper(
            audio_path,
            options.model_size,
            options.force_language.as_deref(),
            temp_dir.path(),
        )
        .await?;

        let stem = audio_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let json_path = temp_dir.path().join(format!("{stem}.json"));
        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| TranscribeError::Model(format!("failed to read whisper output: {e}")))?;

        let parsed: WhisperOutput = serde_json::from_str(&json_content)
            .map_err(|e| TranscribeError::Model(format!("failed to parse whisper JSON: {e}")))?;

        let segments: Vec<Segment> = parsed
            .segments
            .into_iter()
            .map(|s| Segment {
                start: s.start,
                end: s.end,
                text: s.text,
            })
            .collect();

        debug!(
            segments = segments.len(),
            language = %parsed.language,
            "whisper transcription finished"
        );

        let language = options
            .force_language
            .clone()
            .or_else(|| (!parsed.language.is_empty()).then(|| parsed.language.clone()))
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Transcription {
            transcript: parsed.text.trim().to_string(),
            segments,
            language,
        })
    }
}
