//! One attempt of the transcription pipeline for one run:
//! normalize → load model → transcribe → assemble → diarize → finalize.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::assemble::SegmentAssembler;
use super::checkpoint::{Checkpoint, SpansCache, read_spans_cache, resume_token, spans_cache_path, write_spans_cache};
use super::error::JobError;
use super::state::{AttemptMode, JobOutcome, JobRun, RecordProgressSink, TranscriptionStateMachine};
use crate::db::AudioFile;
use crate::transcribe::normalize::load_samples;
use crate::transcribe::{
    AudioNormalizer, EngineRequest, NormalizedAudio, ProgressTracker, RawSpan, SpeakerDiarizer, SpeechEngine,
    Stage, WhisperModel, resume_floor, sanitize_spans,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiarizationSummary {
    pub requested: bool,
    pub applied: bool,
    pub speakers: usize,
    /// Why speakers are missing, when diarization was requested but failed
    pub warning: Option<String>,
}

/// Stored as JSON in `transcription_metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub model: String,
    pub requested_language: Option<String>,
    pub detected_language: Option<String>,
    pub diarization: DiarizationSummary,
    /// Seconds spent per stage in the final attempt
    pub timings: BTreeMap<String, f64>,
    pub resumed: bool,
    pub reused_normalized_audio: bool,
    pub reused_spans: bool,
    pub no_speech: bool,
    pub segment_count: i64,
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub model_used: String,
    pub metadata: JobMetadata,
}

/// Everything inference produced for a run, ready for assembly
pub(crate) struct Prepared {
    pub file: AudioFile,
    pub normalized: NormalizedAudio,
    pub checkpoint: Checkpoint,
    pub spans: Vec<RawSpan>,
    pub model_used: String,
    pub detected_language: Option<String>,
    pub reused_spans: bool,
}

pub struct Pipeline {
    state: TranscriptionStateMachine,
    normalizer: AudioNormalizer,
    engine: Arc<dyn SpeechEngine>,
    diarizer: Option<Arc<dyn SpeakerDiarizer>>,
    assembler: SegmentAssembler,
    threads: usize,
}

impl Pipeline {
    pub fn new(
        state: TranscriptionStateMachine,
        normalizer: AudioNormalizer,
        engine: Arc<dyn SpeechEngine>,
        diarizer: Option<Arc<dyn SpeakerDiarizer>>,
        assembler: SegmentAssembler,
        threads: usize,
    ) -> Self {
        Self {
            state,
            normalizer,
            engine,
            diarizer,
            assembler,
            threads,
        }
    }

    pub(crate) fn assembler(&self) -> &SegmentAssembler {
        &self.assembler
    }

    /// Run the pipeline for `run` and finalize it as completed. Errors leave
    /// the record in PROCESSING; the caller decides what a failure means.
    pub async fn run_attempt(&self, run: &JobRun, mode: AttemptMode) -> Result<AttemptReport, JobError> {
        let file = self.state.fetch(run.file_id).await?;
        if !run.owns(&file) {
            return Err(JobError::Superseded);
        }

        let floor = match &mode {
            AttemptMode::Resume(checkpoint) => {
                let committed = file.last_processed_segment;
                let estimated = checkpoint.estimated_total_segments.unwrap_or(committed);
                let floor = resume_floor(committed, estimated).max(file.transcription_progress);
                if floor > file.transcription_progress {
                    self.state.seed_progress(run, floor, &file.transcription_stage).await?;
                }
                info!(
                    "Resuming file {} at segment {} (progress floor {:.3})",
                    run.file_id, committed, floor
                );
                floor
            }
            AttemptMode::Fresh => 0.0,
        };

        let sink = Arc::new(RecordProgressSink::new(self.state.clone(), *run));
        let (tracker, writer) = ProgressTracker::channel(sink, floor);
        let writer = tokio::spawn(writer.run());

        let result = self.execute(run, file, mode, &tracker).await;

        // Everything reported must be on the record before the terminal write.
        tracker.close();
        let summary = writer.await?;
        let report = result?;
        if summary.superseded {
            return Err(JobError::Superseded);
        }

        let metadata = serde_json::to_value(&report.metadata)?;
        self.state
            .finalize(
                run,
                JobOutcome::Completed {
                    model_used: report.model_used.clone(),
                    metadata,
                },
            )
            .await?;

        Ok(report)
    }

    async fn execute(
        &self,
        run: &JobRun,
        file: AudioFile,
        mode: AttemptMode,
        tracker: &ProgressTracker,
    ) -> Result<AttemptReport, JobError> {
        let resumed = matches!(mode, AttemptMode::Resume(_));
        let file = if resumed {
            file
        } else {
            self.state.restart_from_zero(run).await?;
            self.state.fetch(run.file_id).await?
        };

        let mut timings = BTreeMap::new();
        let mut prepared = self.prepare(run, file, mode, tracker, &mut timings).await?;

        let started = Instant::now();
        tracker.enter(Stage::SavingSegments);
        let assembly = self
            .assembler
            .assemble(run, &prepared.spans, &mut prepared.checkpoint, tracker)
            .await?;
        timings.insert("saving_segments".to_string(), started.elapsed().as_secs_f64());

        let started = Instant::now();
        let diarization = self
            .diarize_step(run, &prepared.file, &prepared.normalized.path, assembly.committed, tracker)
            .await?;
        if diarization.requested {
            timings.insert("diarizing".to_string(), started.elapsed().as_secs_f64());
        }

        tracker.enter(Stage::Finalizing);

        if assembly.committed == 0 {
            info!("No speech found in file {}", run.file_id);
        }

        let metadata = JobMetadata {
            model: prepared.model_used.clone(),
            requested_language: prepared.file.language.clone(),
            detected_language: prepared.detected_language.clone(),
            diarization,
            timings,
            resumed,
            reused_normalized_audio: prepared.normalized.reused,
            reused_spans: prepared.reused_spans,
            no_speech: assembly.committed == 0,
            segment_count: assembly.committed,
        };

        Ok(AttemptReport {
            model_used: prepared.model_used,
            metadata,
        })
    }

    /// Normalize the audio and obtain the span list, reusing whatever an
    /// earlier attempt left behind.
    pub(crate) async fn prepare(
        &self,
        run: &JobRun,
        file: AudioFile,
        mode: AttemptMode,
        tracker: &ProgressTracker,
        timings: &mut BTreeMap<String, f64>,
    ) -> Result<Prepared, JobError> {
        let model: WhisperModel = file
            .model_size
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(JobError::InvalidOptions)?;
        let language = file.language.clone();

        let cached_audio = match &mode {
            AttemptMode::Resume(checkpoint) => Some(PathBuf::from(&checkpoint.normalized_audio_path)),
            AttemptMode::Fresh if file.audio_transformed => file.audio_transformation_path.as_ref().map(PathBuf::from),
            AttemptMode::Fresh => None,
        };

        // Normalize
        let started = Instant::now();
        tracker.enter(Stage::NormalizingAudio);
        let normalizer = self.normalizer.clone();
        let source = PathBuf::from(&file.file_path);
        let file_id = file.id;
        let normalized =
            tokio::task::spawn_blocking(move || normalizer.normalize(file_id, &source, cached_audio.as_deref()))
                .await??;
        self.state.mark_audio_transformed(run, &normalized).await?;
        tracker.emit_in(Stage::NormalizingAudio, 1.0);
        timings.insert("normalizing_audio".to_string(), started.elapsed().as_secs_f64());

        let mut checkpoint = match mode {
            AttemptMode::Resume(checkpoint) => checkpoint,
            AttemptMode::Fresh => {
                Checkpoint::new(&normalized.path, model.as_str(), language.as_deref(), file.include_diarization)
            }
        };
        checkpoint.normalized_audio_path = normalized.path.display().to_string();
        checkpoint.last_segment_index = file.last_processed_segment;
        let token = resume_token(
            Path::new(&file.file_path),
            &normalized.path,
            model.as_str(),
            language.as_deref(),
        );
        self.state.save_checkpoint(run, &checkpoint, &token).await?;

        let cached_spans = checkpoint
            .spans_cache_path
            .as_deref()
            .and_then(|path| read_spans_cache(Path::new(path)));

        if let Some(cache) = cached_spans {
            info!(
                "File {}: reusing {} cached spans, skipping inference",
                run.file_id,
                cache.spans.len()
            );
            let model_used = file
                .whisper_model_loaded
                .clone()
                .unwrap_or_else(|| checkpoint.model.clone());
            return Ok(Prepared {
                file,
                normalized,
                checkpoint,
                spans: cache.spans,
                model_used,
                detected_language: cache.detected_language,
                reused_spans: true,
            });
        }

        // Load model
        let started = Instant::now();
        tracker.enter(Stage::LoadingModel);
        let engine = Arc::clone(&self.engine);
        let model_tracker = tracker.clone();
        let model_used = tokio::task::spawn_blocking(move || engine.load_model(model, &model_tracker)).await??;
        self.state.mark_model_loaded(run, &model_used).await?;
        tracker.emit_in(Stage::LoadingModel, 1.0);
        timings.insert("loading_model".to_string(), started.elapsed().as_secs_f64());

        // Transcribe
        let started = Instant::now();
        tracker.enter(Stage::Transcribing);
        let engine = Arc::clone(&self.engine);
        let engine_tracker = tracker.clone();
        let audio_path = normalized.path.clone();
        let request = EngineRequest {
            model,
            language: language.clone(),
            threads: self.threads,
        };
        let output = tokio::task::spawn_blocking(move || -> Result<_, JobError> {
            let samples = load_samples(&audio_path)?;
            Ok(engine.transcribe(&samples, &request, &engine_tracker)?)
        })
        .await??;
        tracker.emit_in(Stage::Transcribing, 1.0);
        timings.insert("transcribing".to_string(), started.elapsed().as_secs_f64());

        let raw_count = output.spans.len();
        let spans = sanitize_spans(output.spans);
        if spans.len() < raw_count {
            info!(
                "File {}: kept {} of {} spans after cleanup",
                run.file_id,
                spans.len(),
                raw_count
            );
        }

        let cache_path = spans_cache_path(&normalized.path);
        let cache = SpansCache {
            detected_language: output.detected_language.clone(),
            spans,
        };
        match write_spans_cache(&cache_path, &cache) {
            Ok(()) => checkpoint.spans_cache_path = Some(cache_path.display().to_string()),
            Err(e) => warn!("Could not cache spans for file {}: {}", run.file_id, e),
        }
        checkpoint.estimated_total_segments = Some(cache.spans.len() as i64);
        self.state.save_checkpoint(run, &checkpoint, &token).await?;

        Ok(Prepared {
            file,
            normalized,
            checkpoint,
            spans: cache.spans,
            model_used,
            detected_language: output.detected_language,
            reused_spans: false,
        })
    }

    /// Speaker attribution. Never fails the job except when the run was
    /// superseded; problems end up as a warning in the metadata.
    async fn diarize_step(
        &self,
        run: &JobRun,
        file: &AudioFile,
        audio_path: &Path,
        committed: i64,
        tracker: &ProgressTracker,
    ) -> Result<DiarizationSummary, JobError> {
        let mut summary = DiarizationSummary {
            requested: file.include_diarization,
            ..Default::default()
        };
        if !file.include_diarization || committed == 0 {
            return Ok(summary);
        }

        tracker.enter(Stage::Diarizing);
        let Some(diarizer) = &self.diarizer else {
            warn!("Diarization requested for file {} but no diarizer is configured", run.file_id);
            summary.warning = Some("No diarization model configured".to_string());
            return Ok(summary);
        };

        match diarizer.diarize(audio_path).await {
            Ok(turns) => {
                tracker.emit_in(Stage::Diarizing, 0.5);
                match self.assembler.apply_speakers(run, file.project_id, &turns).await {
                    Ok(speakers) => {
                        summary.applied = true;
                        summary.speakers = speakers;
                    }
                    Err(JobError::Superseded) => return Err(JobError::Superseded),
                    Err(e) => {
                        warn!("Could not apply speakers to file {}: {}", run.file_id, e);
                        summary.warning = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!("Diarization failed for file {}: {}", run.file_id, e);
                summary.warning = Some(e.to_string());
            }
        }

        tracker.emit_in(Stage::Diarizing, 1.0);
        Ok(summary)
    }
}
