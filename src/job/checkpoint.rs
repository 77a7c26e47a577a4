//! Durable checkpoint of a running job and the token that says whether it
//! still applies to the current input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

use super::error::JobError;
use crate::transcribe::RawSpan;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Stored as JSON in `processing_checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub normalized_audio_path: String,
    pub model: String,
    pub language: Option<String>,
    pub include_diarization: bool,
    /// Segments committed so far, which is also the next span index to append
    pub last_segment_index: i64,
    pub estimated_total_segments: Option<i64>,
    pub spans_cache_path: Option<String>,
}

impl Checkpoint {
    pub fn new(normalized_audio_path: &Path, model: &str, language: Option<&str>, include_diarization: bool) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            normalized_audio_path: normalized_audio_path.display().to_string(),
            model: model.to_string(),
            language: language.map(str::to_string),
            include_diarization,
            last_segment_index: 0,
            estimated_total_segments: None,
            spans_cache_path: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let checkpoint: Checkpoint =
            serde_json::from_str(raw).map_err(|e| JobError::CorruptCheckpoint(e.to_string()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(JobError::CorruptCheckpoint(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        if checkpoint.last_segment_index < 0 {
            return Err(JobError::CorruptCheckpoint(format!(
                "negative segment index {}",
                checkpoint.last_segment_index
            )));
        }

        Ok(checkpoint)
    }

    pub fn to_json(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Engine output cached next to the normalized audio, so a resume after
/// inference finished does not run inference again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpansCache {
    pub detected_language: Option<String>,
    pub spans: Vec<RawSpan>,
}

pub fn spans_cache_path(normalized: &Path) -> PathBuf {
    normalized.with_extension("spans.json")
}

pub fn write_spans_cache(path: &Path, cache: &SpansCache) -> Result<(), JobError> {
    let json = serde_json::to_vec(cache)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// `None` if the cache is missing or unreadable; callers fall back to inference.
pub fn read_spans_cache(path: &Path) -> Option<SpansCache> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Span cache {:?} unavailable: {}", path, e);
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("Span cache {:?} is corrupt, ignoring: {}", path, e);
            None
        }
    }
}

/// Hex SHA-256 over everything a checkpoint depends on. Any change to the
/// source file or to the model/language options yields a different token.
pub fn resume_token(source: &Path, normalized: &Path, model: &str, language: Option<&str>) -> String {
    let (size, modified) = match fs::metadata(source) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            (meta.len(), modified)
        }
        Err(_) => (0, 0),
    };

    let mut hasher = Sha256::new();
    hasher.update(source.display().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_le_bytes());
    hasher.update(modified.to_le_bytes());
    hasher.update(normalized.display().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(language.unwrap_or("").as_bytes());

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_parse_rejects_garbage() {
        assert!(matches!(Checkpoint::parse("{not json"), Err(JobError::CorruptCheckpoint(_))));

        let mut checkpoint = Checkpoint::new(Path::new("/c/1_16k_mono.wav"), "small", None, false);
        checkpoint.version = 99;
        let raw = checkpoint.to_json().unwrap();
        assert!(matches!(Checkpoint::parse(&raw), Err(JobError::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_checkpoint_keeps_null_language() {
        let checkpoint = Checkpoint::new(Path::new("/c/1_16k_mono.wav"), "small", None, true);
        let raw = checkpoint.to_json().unwrap();
        assert!(raw.contains("\"language\":null"));
        assert_eq!(Checkpoint::parse(&raw).unwrap(), checkpoint);
    }

    #[test]
    fn test_resume_token_tracks_options_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("talk.wav");
        fs::write(&source, b"first").unwrap();
        let normalized = dir.path().join("1_16k_mono.wav");

        let token = resume_token(&source, &normalized, "small", Some("fi"));
        assert_eq!(token, resume_token(&source, &normalized, "small", Some("fi")));
        assert_eq!(token.len(), 64);
        assert_ne!(token, resume_token(&source, &normalized, "medium", Some("fi")));
        assert_ne!(token, resume_token(&source, &normalized, "small", None));

        fs::write(&source, b"changed contents").unwrap();
        assert_ne!(token, resume_token(&source, &normalized, "small", Some("fi")));
    }

    #[test]
    fn test_spans_cache_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = spans_cache_path(&dir.path().join("7_16k_mono.wav"));
        assert!(path.to_string_lossy().ends_with("7_16k_mono.spans.json"));

        let cache = SpansCache {
            detected_language: Some("en".to_string()),
            spans: vec![RawSpan::new(0.0, 5.0, "Hello")],
        };
        write_spans_cache(&path, &cache).unwrap();
        assert_eq!(read_spans_cache(&path), Some(cache));

        fs::write(&path, b"[truncated").unwrap();
        assert_eq!(read_spans_cache(&path), None);
    }
}
