//! Transcription: audio file in, transcript + timestamped segments out.

pub mod whisper;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Segment;
use crate::error::ActivityError;

pub use whisper::WhisperTranscriber;

/// Whisper model size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            other => Err(format!("unknown model size: {other}")),
        }
    }
}

/// Options for a single transcription call.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub model_size: ModelSize,
    /// Skip language detection and force this ISO code.
    pub force_language: Option<String>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            model_size: ModelSize::Base,
            force_language: None,
        }
    }
}

/// Result of a transcription call.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub transcript: String,
    pub segments: Vec<Segment>,
    /// Detected (or forced) ISO language code.
    pub language: String,
}

/// Transcription failures, classified for the retry policy.
#[derive(Debug, Error)]
pub enum TranscribeError {
    /// The audio file does not exist; permanent.
    #[error("file-missing: {0}")]
    FileMissing(String),

    /// The audio could not be decoded; retriable.
    #[error("decode-error: {0}")]
    Decode(String),

    /// The model itself failed; retriable.
    #[error("model-error: {0}")]
    Model(String),
}

impl From<TranscribeError> for ActivityError {
    fn from(err: TranscribeError) -> Self {
        match err {
            TranscribeError::FileMissing(_) => ActivityError::permanent(err.to_string()),
            TranscribeError::Decode(_) | TranscribeError::Model(_) => {
                ActivityError::transient(err.to_string())
            }
        }
    }
}

/// A blocking long operation turning audio into text. Expected wall time is
/// on the order of the audio duration.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn model_size_round_trips() {
        for size in [
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
            ModelSize::Large,
        ] {
            assert_eq!(size.as_str().parse::<ModelSize>().unwrap(), size);
        }
        assert!("huge".parse::<ModelSize>().is_err());
    }

    #[test]
    fn only_missing_files_are_permanent() {
        let missing: ActivityError = TranscribeError::FileMissing("a.mp3".into()).into();
        assert_eq!(missing.kind, ErrorKind::Permanent);

        let decode: ActivityError = TranscribeError::Decode("corrupt header".into()).into();
        assert_eq!(decode.kind, ErrorKind::Transient);

        let model: ActivityError = TranscribeError::Model("cuda OOM".into()).into();
        assert_eq!(model.kind, ErrorKind::Transient);
    }
}
