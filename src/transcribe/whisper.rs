use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::engine::{EngineError, EngineOutput, EngineRequest, RawSpan, SpeechEngine, WhisperModel};
use super::normalize::WHISPER_SAMPLE_RATE;
use super::progress::{ProgressTracker, Stage};

const DOWNLOAD_BUFFER_SIZE: usize = 256 * 1024;

/// Check if a model is already downloaded
pub fn is_model_downloaded(models_dir: &Path, model: WhisperModel) -> bool {
    let path = models_dir.join(model.filename());

    // Check if file size is reasonable (at least 50% of expected)
    match fs::metadata(&path) {
        Ok(metadata) => {
            let expected_bytes = model.size_mb() * 1024 * 1024;
            metadata.len() >= expected_bytes / 2
        }
        Err(_) => false,
    }
}

/// Download a Whisper model from Hugging Face, reporting download progress
/// into the loading-model stage.
pub fn download_model(
    models_dir: &Path,
    model: WhisperModel,
    tracker: &ProgressTracker,
) -> Result<PathBuf, EngineError> {
    let path = models_dir.join(model.filename());

    if is_model_downloaded(models_dir, model) {
        debug!("Model {} already downloaded at {:?}", model, path);
        return Ok(path);
    }

    fs::create_dir_all(models_dir)?;

    info!("Downloading Whisper {} model (~{}MB)...", model, model.size_mb());

    let url = model.hf_url();
    let mut response = reqwest::blocking::Client::new()
        .get(url)
        .send()
        .map_err(|e| EngineError::Download(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(EngineError::Download(format!(
            "HTTP {} from {}",
            response.status(),
            url
        )));
    }

    let total_size = response
        .content_length()
        .unwrap_or(model.size_mb() * 1024 * 1024);

    let temp_path = path.with_extension("bin.tmp");
    let mut file = File::create(&temp_path)?;
    let mut downloaded: u64 = 0;
    let mut buf = vec![0u8; DOWNLOAD_BUFFER_SIZE];

    loop {
        let n = response
            .read(&mut buf)
            .map_err(|e| EngineError::Download(format!("Failed to read response: {}", e)))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        downloaded += n as u64;
        // Download is most of model loading; keep the tail for context init.
        tracker.emit_in(Stage::LoadingModel, 0.9 * downloaded as f64 / total_size.max(1) as f64);
    }
    file.flush()?;
    drop(file);

    fs::rename(&temp_path, &path)?;
    info!("Model downloaded to {:?} ({} bytes)", path, downloaded);

    Ok(path)
}

/// whisper.cpp behind the engine seam.
///
/// Keeps the most recently loaded context so consecutive jobs on the same
/// model skip the reload.
pub struct WhisperEngine {
    models_dir: PathBuf,
    loaded: Mutex<Option<(WhisperModel, Arc<WhisperContext>)>>,
}

impl WhisperEngine {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            loaded: Mutex::new(None),
        }
    }

    fn context(&self, model: WhisperModel, tracker: &ProgressTracker) -> Result<Arc<WhisperContext>, EngineError> {
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| EngineError::Init("model cache lock poisoned".to_string()))?;

        if let Some((current, ctx)) = loaded.as_ref() {
            if *current == model {
                return Ok(ctx.clone());
            }
        }

        let path = download_model(&self.models_dir, model, tracker)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| EngineError::Init(format!("Model path is not valid UTF-8: {:?}", path)))?;

        info!("Loading Whisper {} model...", model);
        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| EngineError::Init(format!("Failed to load model: {}", e)))?;
        let ctx = Arc::new(ctx);

        *loaded = Some((model, ctx.clone()));
        Ok(ctx)
    }
}

impl SpeechEngine for WhisperEngine {
    fn load_model(&self, model: WhisperModel, tracker: &ProgressTracker) -> Result<String, EngineError> {
        self.context(model, tracker)?;
        tracker.emit_in(Stage::LoadingModel, 1.0);
        info!("Whisper {} model ready", model);
        Ok(model.as_str().to_string())
    }

    fn transcribe(
        &self,
        samples: &[f32],
        request: &EngineRequest,
        tracker: &ProgressTracker,
    ) -> Result<EngineOutput, EngineError> {
        let ctx = self.context(request.model, tracker)?;
        let start_time = std::time::Instant::now();
        let audio_secs = samples.len() as f32 / WHISPER_SAMPLE_RATE as f32;

        info!(
            "Transcribing {:.1}s of audio with {} ({} threads)",
            audio_secs, request.model, request.threads
        );

        // Use greedy sampling for speed (beam search is 2-3x slower)
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(request.threads.max(1) as i32);
        params.set_token_timestamps(false);

        // ===== HALLUCINATION PREVENTION =====
        params.set_no_speech_thold(0.6);
        params.set_entropy_thold(2.4);
        params.set_logprob_thold(-1.0);
        params.set_temperature(0.0);
        params.set_temperature_inc(0.2);
        // Don't use previous context (prevents hallucination propagation)
        params.set_no_context(true);
        params.set_suppress_non_speech_tokens(true);
        params.set_max_len(80);

        match request.language.as_deref() {
            Some(lang) => params.set_language(Some(lang)),
            None => params.set_language(Some("auto")),
        }
        params.set_translate(false);

        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_print_special(false);

        let progress = tracker.clone();
        params.set_progress_callback_safe(move |percent: i32| {
            progress.emit_in(Stage::Transcribing, percent as f64 / 100.0);
        });

        let mut state = ctx
            .create_state()
            .map_err(|e| EngineError::Transcription(format!("Failed to create state: {}", e)))?;

        state
            .full(params, samples)
            .map_err(|e| EngineError::Transcription(format!("Inference failed: {}", e)))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| EngineError::Transcription(format!("Failed to get segments: {}", e)))?;

        let mut spans = Vec::with_capacity(num_segments.max(0) as usize);
        for i in 0..num_segments {
            let start_ts = state
                .full_get_segment_t0(i)
                .map_err(|e| EngineError::Transcription(format!("Failed to get start time: {}", e)))?;
            let end_ts = state
                .full_get_segment_t1(i)
                .map_err(|e| EngineError::Transcription(format!("Failed to get end time: {}", e)))?;
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| EngineError::Transcription(format!("Failed to get text: {}", e)))?;

            // Timestamps are in centiseconds (1/100 second)
            spans.push(RawSpan::new(start_ts as f64 / 100.0, end_ts as f64 / 100.0, text));
        }

        let detected_language = state
            .full_lang_id_from_state()
            .ok()
            .and_then(|id| whisper_rs::get_lang_str(id).map(|s| s.to_string()));

        tracker.emit_in(Stage::Transcribing, 1.0);

        let elapsed = start_time.elapsed();
        info!(
            "Transcribed {:.1}s in {:.1}s ({:.1}x realtime): {} raw spans, language {:?}",
            audio_secs,
            elapsed.as_secs_f32(),
            audio_secs / elapsed.as_secs_f32().max(0.001),
            spans.len(),
            detected_language
        );

        Ok(EngineOutput {
            spans,
            detected_language,
        })
    }
}
