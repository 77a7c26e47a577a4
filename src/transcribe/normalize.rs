use byteorder::{ByteOrder, LittleEndian};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Whisper's required sample rate
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Source audio not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("FFmpeg not available at {path}: {reason}")]
    FfmpegUnavailable { path: PathBuf, reason: String },
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("No audio samples decoded from {0}")]
    Empty(PathBuf),
}

/// Result of a normalization call
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    /// Canonical 16kHz mono WAV
    pub path: PathBuf,
    pub duration_secs: f64,
    /// True when a cached conversion was reused and nothing was decoded
    pub reused: bool,
}

/// Converts arbitrary input audio into the canonical form the engine expects:
/// single channel, 16kHz, 16-bit PCM WAV.
#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    cache_dir: PathBuf,
    ffmpeg_path: PathBuf,
}

impl AudioNormalizer {
    pub fn new(cache_dir: impl Into<PathBuf>, ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Where the canonical conversion of a file lives
    pub fn canonical_path(&self, file_id: i64) -> PathBuf {
        self.cache_dir.join(format!("{}_16k_mono.wav", file_id))
    }

    /// Normalize `source`, skipping all work if `cached` points at an existing
    /// conversion.
    ///
    /// Blocking: decodes in-process for WAV input and shells out to FFmpeg for
    /// everything else.
    pub fn normalize(
        &self,
        file_id: i64,
        source: &Path,
        cached: Option<&Path>,
    ) -> Result<NormalizedAudio, NormalizeError> {
        if let Some(cached) = cached {
            if cached.exists() {
                match probe_wav_duration(cached) {
                    Ok(duration_secs) => {
                        info!("Reusing normalized audio for file {} at {:?}", file_id, cached);
                        return Ok(NormalizedAudio {
                            path: cached.to_path_buf(),
                            duration_secs,
                            reused: true,
                        });
                    }
                    Err(e) => warn!("Cached audio {:?} unreadable, converting again: {}", cached, e),
                }
            }
        }

        if !source.exists() {
            return Err(NormalizeError::SourceNotFound(source.to_path_buf()));
        }

        info!("Normalizing audio for file {}: {:?}", file_id, source);

        let samples = if is_wav(source) {
            decode_wav(source)?
        } else {
            self.decode_with_ffmpeg(source)?
        };

        if samples.is_empty() {
            return Err(NormalizeError::Empty(source.to_path_buf()));
        }

        fs::create_dir_all(&self.cache_dir)?;
        let path = self.canonical_path(file_id);
        write_canonical_wav(&path, &samples)?;

        let duration_secs = samples.len() as f64 / WHISPER_SAMPLE_RATE as f64;
        info!(
            "Normalized {} samples at 16kHz ({:.1}s) to {:?}",
            samples.len(),
            duration_secs,
            path
        );

        Ok(NormalizedAudio {
            path,
            duration_secs,
            reused: false,
        })
    }

    /// Decode audio file to raw f32 samples using FFmpeg
    fn decode_with_ffmpeg(&self, source: &Path) -> Result<Vec<f32>, NormalizeError> {
        debug!("Decoding {:?} with {:?}", source, self.ffmpeg_path);

        let mut child = Command::new(&self.ffmpeg_path)
            .arg("-nostdin")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(source)
            .arg("-f")
            .arg("f32le")
            .arg("-acodec")
            .arg("pcm_f32le")
            .arg("-ar")
            .arg(WHISPER_SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg("1")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NormalizeError::FfmpegUnavailable {
                path: self.ffmpeg_path.clone(),
                reason: e.to_string(),
            })?;

        // Drained on its own thread: a full stderr pipe would stall ffmpeg
        // while we are still blocked reading stdout.
        let stderr_pipe = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr_pipe {
                if let Err(e) = stderr.read_to_end(&mut buf) {
                    debug!("Could not read ffmpeg stderr: {}", e);
                }
            }
            buf
        });

        let mut raw_bytes = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_end(&mut raw_bytes)?;
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("ffmpeg exited with an error");
            return Err(NormalizeError::Decode {
                path: source.to_path_buf(),
                reason: reason.to_string(),
            });
        }

        if raw_bytes.len() % 4 != 0 {
            return Err(NormalizeError::Decode {
                path: source.to_path_buf(),
                reason: format!("{} bytes is not a whole number of f32 samples", raw_bytes.len()),
            });
        }

        let mut samples = vec![0.0f32; raw_bytes.len() / 4];
        LittleEndian::read_f32_into(&raw_bytes, &mut samples);

        Ok(samples)
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
        .unwrap_or(false)
}

/// Decode a WAV file in-process: any bit depth, any channel count, any rate.
fn decode_wav(path: &Path) -> Result<Vec<f32>, NormalizeError> {
    let decode_err = |e: hound::Error| NormalizeError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = hound::WavReader::open(path).map_err(decode_err)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    debug!(
        "Decoded {} samples ({} channels, {}Hz, {} bits)",
        interleaved.len(),
        spec.channels,
        spec.sample_rate,
        spec.bits_per_sample
    );

    let mono = downmix(&interleaved, spec.channels as usize);
    Ok(resample(&mono, spec.sample_rate, WHISPER_SAMPLE_RATE))
}

/// Average interleaved channels into one
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio to `to_rate`.
///
/// Integer downsampling ratios average each block of samples; everything else
/// uses linear interpolation.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if from_rate > to_rate && from_rate % to_rate == 0 {
        let ratio = (from_rate / to_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let step = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / step).floor().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Write samples as 16kHz mono 16-bit WAV, via a temp file so a crash never
/// leaves a truncated cache entry behind.
fn write_canonical_wav(path: &Path, samples: &[f32]) -> Result<(), NormalizeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: WHISPER_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let temp_path = path.with_extension("wav.tmp");
    let to_io = |e: hound::Error| match e {
        hound::Error::IoError(io) => NormalizeError::Io(io),
        other => NormalizeError::Io(std::io::Error::other(other.to_string())),
    };

    let mut writer = hound::WavWriter::create(&temp_path, spec).map_err(to_io)?;
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer
            .write_sample((clamped * 32767.0) as i16)
            .map_err(to_io)?;
    }
    writer.finalize().map_err(to_io)?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a canonical WAV back into normalized f32 samples
pub fn load_samples(path: &Path) -> Result<Vec<f32>, NormalizeError> {
    let mut reader = hound::WavReader::open(path).map_err(|e| NormalizeError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    reader
        .samples::<i16>()
        .map(|s| s.map(|s| s as f32 / 32768.0))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NormalizeError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Duration of a WAV file from its header, without decoding samples
pub fn probe_wav_duration(path: &Path) -> Result<f64, NormalizeError> {
    let reader = hound::WavReader::open(path).map_err(|e| NormalizeError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}
