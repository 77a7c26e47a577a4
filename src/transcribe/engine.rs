use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::progress::ProgressTracker;

/// Shortest span we persist; engines occasionally report zero-length spans
pub const MIN_SPAN_SECS: f64 = 0.01;
/// Allow max 2 consecutive identical spans, the rest is likely hallucination
const MAX_REPEATS: usize = 2;

/// Available Whisper model sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperModel {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    /// Get the Hugging Face URL for this model
    pub fn hf_url(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
            WhisperModel::Base => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
            WhisperModel::Small => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
            WhisperModel::Medium => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
            WhisperModel::Large => "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
        }
    }

    /// Get the filename for this model
    pub fn filename(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "ggml-tiny.bin",
            WhisperModel::Base => "ggml-base.bin",
            WhisperModel::Small => "ggml-small.bin",
            WhisperModel::Medium => "ggml-medium.bin",
            WhisperModel::Large => "ggml-large-v3.bin",
        }
    }

    /// Get approximate model size in MB
    pub fn size_mb(&self) -> u64 {
        match self {
            WhisperModel::Tiny => 75,
            WhisperModel::Base => 142,
            WhisperModel::Small => 466,
            WhisperModel::Medium => 1500,
            WhisperModel::Large => 3100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::Large => "large",
        }
    }
}

impl Default for WhisperModel {
    fn default() -> Self {
        WhisperModel::Small
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large" | "large-v3" => Ok(WhisperModel::Large),
            _ => Err(format!("Unknown model: {}. Use tiny, base, small, medium, or large", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to download model: {0}")]
    Download(String),
    #[error("Failed to initialize engine: {0}")]
    Init(String),
    #[error("Transcription failed: {0}")]
    Transcription(String),
    #[error("Engine support not compiled in: {0}")]
    Unavailable(String),
}

/// One time-stamped span of engine output, in seconds from the start of the audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl RawSpan {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub model: WhisperModel,
    /// `None` lets the engine detect the language
    pub language: Option<String>,
    pub threads: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub spans: Vec<RawSpan>,
    pub detected_language: Option<String>,
}

/// A blocking speech-recognition engine.
///
/// Both calls may run for minutes; callers run them off the async runtime.
/// Progress goes through the tracker handed in, never through console output.
pub trait SpeechEngine: Send + Sync {
    /// Make `model` ready for inference, returning the identifier of what was
    /// actually loaded.
    fn load_model(&self, model: WhisperModel, tracker: &ProgressTracker) -> Result<String, EngineError>;

    /// Transcribe 16kHz mono samples.
    fn transcribe(
        &self,
        samples: &[f32],
        request: &EngineRequest,
        tracker: &ProgressTracker,
    ) -> Result<EngineOutput, EngineError>;
}

/// Clean raw engine output into the exact list of spans that become segments.
///
/// Deterministic for a given input, so a resumed run maps span index `n` to
/// the same segment sequence `n` as the interrupted run did.
pub fn sanitize_spans(raw: Vec<RawSpan>) -> Vec<RawSpan> {
    let mut spans: Vec<RawSpan> = Vec::with_capacity(raw.len());
    let mut last_text: Option<String> = None;
    let mut repeat_count = 0;

    for span in raw {
        let text = span.text.trim().to_string();
        if text.is_empty() || !span.start.is_finite() || !span.end.is_finite() {
            continue;
        }

        let is_repeat = last_text.as_deref() == Some(text.as_str());
        if is_repeat {
            repeat_count += 1;
            if repeat_count >= MAX_REPEATS {
                continue;
            }
        } else {
            repeat_count = 0;
        }
        last_text = Some(text.clone());

        let start = span.start.max(0.0);
        let end = if span.end > start { span.end } else { start + MIN_SPAN_SECS };
        spans.push(RawSpan { start, end, text });
    }

    spans
}
