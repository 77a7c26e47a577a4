//! Process configuration read from the environment. The binary loads `.env`
//! with dotenvy once at startup, before anything here runs.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_AUDIO_CACHE_DIR: &str = "cache/audio";
const DEFAULT_MODELS_DIR: &str = "models/whisper";
const DEFAULT_FFMPEG: &str = "ffmpeg";
/// Loading a large model can legitimately take many minutes
const DEFAULT_INIT_STALL_SECS: u64 = 30 * 60;
const DEFAULT_ACTIVE_STALL_SECS: u64 = 10 * 60;
const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_SEGMENT_BATCH_SIZE: usize = 20;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Stall tolerances, one per tracker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallTimeouts {
    pub initializing: Duration,
    pub active: Duration,
}

impl Default for StallTimeouts {
    fn default() -> Self {
        Self {
            initializing: Duration::from_secs(DEFAULT_INIT_STALL_SECS),
            active: Duration::from_secs(DEFAULT_ACTIVE_STALL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub audio_cache_dir: PathBuf,
    pub models_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub stall: StallTimeouts,
    pub max_recovery_attempts: u32,
    /// Pause before retrying a failed attempt
    pub retry_delay: Duration,
    pub segment_batch_size: usize,
    /// Inference threads (0 = use available parallelism)
    pub whisper_threads: usize,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let path_or = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let initializing = parse_or(&lookup, "INIT_STALL_TIMEOUT_SECS", DEFAULT_INIT_STALL_SECS)?;
        let active = parse_or(&lookup, "ACTIVE_STALL_TIMEOUT_SECS", DEFAULT_ACTIVE_STALL_SECS)?;
        let max_recovery_attempts =
            parse_or(&lookup, "MAX_RECOVERY_ATTEMPTS", DEFAULT_MAX_RECOVERY_ATTEMPTS)?;
        let segment_batch_size =
            parse_or(&lookup, "SEGMENT_BATCH_SIZE", DEFAULT_SEGMENT_BATCH_SIZE)?;
        if segment_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SEGMENT_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let whisper_threads = parse_or(&lookup, "WHISPER_THREADS", 0usize)?;
        let retry_delay = parse_or(&lookup, "RECOVERY_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY_SECS)?;

        Ok(Self {
            database_url,
            audio_cache_dir: path_or("AUDIO_CACHE_DIR", DEFAULT_AUDIO_CACHE_DIR),
            models_dir: path_or("MODELS_DIR", DEFAULT_MODELS_DIR),
            ffmpeg_path: path_or("FFMPEG_PATH", DEFAULT_FFMPEG),
            stall: StallTimeouts {
                initializing: Duration::from_secs(initializing),
                active: Duration::from_secs(active),
            },
            max_recovery_attempts,
            retry_delay: Duration::from_secs(retry_delay),
            segment_batch_size,
            whisper_threads,
        })
    }

    /// Thread count handed to the inference engine.
    pub fn inference_threads(&self) -> usize {
        if self.whisper_threads > 0 {
            return self.whisper_threads;
        }
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[("DATABASE_URL", "sqlite:data/jobs.db")]))
            .unwrap();

        assert_eq!(settings.database_url, "sqlite:data/jobs.db");
        assert_eq!(settings.audio_cache_dir, PathBuf::from("cache/audio"));
        assert_eq!(settings.stall, StallTimeouts::default());
        assert_eq!(settings.max_recovery_attempts, 3);
        assert_eq!(settings.segment_batch_size, 20);
        assert_eq!(settings.retry_delay, Duration::from_secs(5));
        assert!(settings.inference_threads() >= 1);
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("ACTIVE_STALL_TIMEOUT_SECS", "42"),
            ("SEGMENT_BATCH_SIZE", "5"),
            ("WHISPER_THREADS", "2"),
        ]))
        .unwrap();

        assert_eq!(settings.stall.active, Duration::from_secs(42));
        assert_eq!(settings.segment_batch_size, 5);
        assert_eq!(settings.inference_threads(), 2);
    }

    #[test]
    fn test_missing_database_url() {
        let err = Settings::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:x.db"),
            ("MAX_RECOVERY_ATTEMPTS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_RECOVERY_ATTEMPTS", .. }));

        let err = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:x.db"),
            ("SEGMENT_BATCH_SIZE", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SEGMENT_BATCH_SIZE", .. }));
    }
}
