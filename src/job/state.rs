//! The job record's lifecycle: PENDING → PROCESSING → COMPLETED | FAILED,
//! and back to PENDING through `clear`.
//!
//! Every operation takes a fresh session from the [`SessionFactory`]. Writes
//! on behalf of a worker carry its [`JobRun`], so a worker whose run was
//! cleared, cancelled or taken over gets [`JobError::Superseded`] instead of
//! touching the record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, resume_token, spans_cache_path};
use super::error::JobError;
use crate::config::StallTimeouts;
use crate::db::audio_files::{self, ClaimRequest};
use crate::db::{AudioFile, SessionFactory, TranscriptionStatus, segments, speakers};
use crate::transcribe::{NormalizedAudio, Phase, ProgressSink, ProgressUpdate, SinkError, WhisperModel};

pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
/// Optimistic start attempts before giving up on a contended record
const START_RETRIES: usize = 3;

/// Empty or blank language means auto-detect
pub fn normalize_language(language: Option<&str>) -> Option<String> {
    language
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub model_size: WhisperModel,
    /// ISO 639-1 code; `None` means auto-detect
    pub language: Option<String>,
    pub include_diarization: bool,
}

impl JobOptions {
    pub fn new(model_size: WhisperModel) -> Self {
        Self {
            model_size,
            language: None,
            include_diarization: false,
        }
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = normalize_language(language);
        self
    }

    pub fn with_diarization(mut self, include_diarization: bool) -> Self {
        self.include_diarization = include_diarization;
        self
    }
}

/// Identity of one worker's claim on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRun {
    pub file_id: i64,
    pub generation: i64,
}

impl JobRun {
    /// Whether this run is still the one the record belongs to
    pub fn owns(&self, file: &AudioFile) -> bool {
        file.id == self.file_id
            && file.job_generation == self.generation
            && file.transcription_status == TranscriptionStatus::Processing
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptMode {
    /// Start over: drop partial segments and the checkpoint
    Fresh,
    /// Continue from the checkpoint's segment cursor
    Resume(Checkpoint),
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub run: JobRun,
    pub mode: AttemptMode,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        model_used: String,
        metadata: serde_json::Value,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub status: TranscriptionStatus,
    pub progress: f64,
    pub stage: String,
    pub segment_count: i64,
    pub speaker_count: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub model_used: Option<String>,
    pub language: Option<String>,
    pub interruption_count: i64,
    pub recovery_attempts: i64,
    pub can_resume: bool,
    pub is_stuck: bool,
}

impl JobStatus {
    pub fn from_record(
        file: &AudioFile,
        segment_count: i64,
        speaker_count: i64,
        stall: &StallTimeouts,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: file.transcription_status,
            progress: file.transcription_progress,
            stage: file.transcription_stage.clone(),
            segment_count,
            speaker_count,
            error_message: file.error_message.clone(),
            started_at: file.transcription_started_at,
            completed_at: file.transcription_completed_at,
            model_used: file.model_used.clone(),
            language: file.language.clone(),
            interruption_count: file.interruption_count,
            recovery_attempts: file.recovery_attempts,
            can_resume: can_resume(file),
            is_stuck: is_stuck(file, stall, now),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    pub deleted_segments: u64,
    pub deleted_speakers: u64,
}

pub fn can_resume(file: &AudioFile) -> bool {
    matches!(
        file.transcription_status,
        TranscriptionStatus::Processing | TranscriptionStatus::Failed
    ) && file.resume_token.is_some()
        && file
            .processing_checkpoint
            .as_deref()
            .is_some_and(|raw| Checkpoint::parse(raw).is_ok())
}

/// A PROCESSING job whose last sign of life is older than its phase allows
pub fn is_stuck(file: &AudioFile, stall: &StallTimeouts, now: DateTime<Utc>) -> bool {
    if file.transcription_status != TranscriptionStatus::Processing {
        return false;
    }
    let Some(last_seen) = file.last_progress_at.or(file.transcription_started_at) else {
        return true;
    };
    let timeout = Phase::infer(&file.transcription_stage, file.transcription_progress).timeout(stall);
    match (now - last_seen).to_std() {
        Ok(idle) => idle > timeout,
        Err(_) => false,
    }
}

/// Decide how a run over `file` with the given options should begin: resume if
/// the stored checkpoint is readable and its token still matches, otherwise
/// start from zero.
///
/// An unreadable checkpoint is an error so the caller can count it against
/// the attempt budget before starting over.
pub fn resume_mode(file: &AudioFile, model: &str, language: Option<&str>) -> Result<AttemptMode, JobError> {
    let (Some(raw), Some(token)) = (file.processing_checkpoint.as_deref(), file.resume_token.as_deref()) else {
        return Ok(AttemptMode::Fresh);
    };

    let checkpoint = Checkpoint::parse(raw).inspect_err(|e| {
        warn!("Checkpoint of file {} is unreadable: {}", file.id, e);
    })?;

    let expected = resume_token(
        Path::new(&file.file_path),
        Path::new(&checkpoint.normalized_audio_path),
        model,
        language,
    );
    if expected != token {
        info!("Checkpoint of file {} no longer matches its input, restarting from zero", file.id);
        return Ok(AttemptMode::Fresh);
    }

    Ok(AttemptMode::Resume(checkpoint))
}

/// Resume decision for recovery, using the options stored on the record
pub fn recovery_mode(file: &AudioFile) -> Result<AttemptMode, JobError> {
    resume_mode(
        file,
        file.model_size.as_deref().unwrap_or_default(),
        file.language.as_deref(),
    )
}

fn fenced(rows: u64) -> Result<(), JobError> {
    if rows == 0 { Err(JobError::Superseded) } else { Ok(()) }
}

#[derive(Debug, Clone)]
pub struct TranscriptionStateMachine {
    sessions: SessionFactory,
}

impl TranscriptionStateMachine {
    pub fn new(sessions: SessionFactory) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    pub async fn fetch(&self, file_id: i64) -> Result<AudioFile, JobError> {
        let mut conn = self.sessions.session().await?;
        audio_files::fetch(&mut conn, file_id)
            .await?
            .ok_or(JobError::NotFound(file_id))
    }

    /// Move the record into PROCESSING for a new run.
    ///
    /// The guard and the write are one compare-and-set, so concurrent starts
    /// on the same file produce exactly one winner.
    pub async fn start(&self, file_id: i64, options: &JobOptions) -> Result<Claim, JobError> {
        let language = options.language.as_deref();
        let model = options.model_size.as_str();

        for _ in 0..START_RETRIES {
            let mut conn = self.sessions.session().await?;
            let file = audio_files::fetch(&mut conn, file_id)
                .await?
                .ok_or(JobError::NotFound(file_id))?;

            if file.transcription_status == TranscriptionStatus::Processing {
                return Err(JobError::AlreadyRunning(file_id));
            }

            let resume = match file.transcription_status {
                TranscriptionStatus::Failed => resume_mode(&file, model, language),
                _ => Ok(AttemptMode::Fresh),
            };

            let request = ClaimRequest {
                language,
                model_size: model,
                include_diarization: options.include_diarization,
            };
            let claimed = audio_files::claim(
                &mut conn,
                file_id,
                file.transcription_status,
                file.job_generation,
                request,
                Utc::now(),
            )
            .await?;

            if let Some(generation) = claimed {
                // The claim reset the attempt budget; a corrupt checkpoint
                // spends the first attempt of the new run.
                let mode = match resume {
                    Ok(mode) => mode,
                    Err(_) => {
                        audio_files::bump_recovery_attempts(&mut conn, file_id, generation).await?;
                        AttemptMode::Fresh
                    }
                };
                info!(
                    "Started transcription of file {} (generation {}, model {}, language {:?}, {})",
                    file_id,
                    generation,
                    model,
                    language,
                    if matches!(mode, AttemptMode::Resume(_)) { "resuming" } else { "fresh" }
                );
                return Ok(Claim {
                    run: JobRun { file_id, generation },
                    mode,
                });
            }
            debug!("Start of file {} raced with another writer, retrying", file_id);
        }

        Err(JobError::AlreadyRunning(file_id))
    }

    /// Persist a progress update for `run`. Regressions are rejected and
    /// logged, never applied.
    pub async fn report_progress(&self, run: &JobRun, update: ProgressUpdate) -> Result<(), JobError> {
        let mut conn = self.sessions.session().await?;
        let now = Utc::now();

        match update {
            ProgressUpdate::Advance { fraction, stage } => {
                let rows = audio_files::update_progress(
                    &mut conn,
                    run.file_id,
                    run.generation,
                    fraction,
                    stage.as_str(),
                    now,
                )
                .await?;
                if rows == 1 {
                    return Ok(());
                }

                let file = audio_files::fetch(&mut conn, run.file_id)
                    .await?
                    .ok_or(JobError::NotFound(run.file_id))?;
                if !run.owns(&file) {
                    return Err(JobError::Superseded);
                }
                warn!(
                    "Rejected progress regression for file {}: stored {:.4}, attempted {:.4} ({})",
                    run.file_id, file.transcription_progress, fraction, stage
                );
                Err(JobError::ProgressRegression {
                    stored: file.transcription_progress,
                    attempted: fraction,
                })
            }
            ProgressUpdate::Heartbeat { stage } => fenced(
                audio_files::touch_stage(&mut conn, run.file_id, run.generation, stage.as_str(), now).await?,
            ),
        }
    }

    /// Starting fraction of a resumed run. May sit above zero, which is the
    /// one place the stored fraction is written without the monotonic guard.
    pub async fn seed_progress(&self, run: &JobRun, fraction: f64, stage: &str) -> Result<(), JobError> {
        let mut conn = self.sessions.session().await?;
        fenced(audio_files::seed_progress(&mut conn, run.file_id, run.generation, fraction, stage, Utc::now()).await?)
    }

    pub async fn mark_audio_transformed(&self, run: &JobRun, audio: &NormalizedAudio) -> Result<(), JobError> {
        let mut conn = self.sessions.session().await?;
        let path = audio.path.display().to_string();
        fenced(
            audio_files::set_audio_transformed(&mut conn, run.file_id, run.generation, &path, audio.duration_secs)
                .await?,
        )
    }

    pub async fn mark_model_loaded(&self, run: &JobRun, model: &str) -> Result<(), JobError> {
        let mut conn = self.sessions.session().await?;
        fenced(audio_files::set_model_loaded(&mut conn, run.file_id, run.generation, model).await?)
    }

    pub async fn save_checkpoint(&self, run: &JobRun, checkpoint: &Checkpoint, token: &str) -> Result<(), JobError> {
        let json = checkpoint.to_json()?;
        let mut conn = self.sessions.session().await?;
        fenced(audio_files::save_checkpoint(&mut conn, run.file_id, run.generation, &json, token).await?)
    }

    /// Drop everything a previous attempt of this run produced. The cached
    /// normalized audio is kept; it does not depend on the attempt.
    pub async fn restart_from_zero(&self, run: &JobRun) -> Result<u64, JobError> {
        let mut tx = self.sessions.transaction().await?;
        if !audio_files::fence(&mut *tx, run.file_id, run.generation, Utc::now()).await? {
            return Err(JobError::Superseded);
        }
        let deleted = segments::delete_for_file(&mut *tx, run.file_id).await?;
        speakers::delete_for_file(&mut *tx, run.file_id).await?;
        fenced(audio_files::reset_cursor(&mut *tx, run.file_id, run.generation).await?)?;
        tx.commit().await?;

        if deleted > 0 {
            info!(
                "Discarded {} partial segments of file {}, progress reset to zero",
                deleted, run.file_id
            );
        }
        Ok(deleted)
    }

    /// Terminal transition of a run. Attempt counters are not touched here.
    pub async fn finalize(&self, run: &JobRun, outcome: JobOutcome) -> Result<(), JobError> {
        let mut tx = self.sessions.transaction().await?;
        let now = Utc::now();
        if !audio_files::fence(&mut *tx, run.file_id, run.generation, now).await? {
            return Err(JobError::Superseded);
        }

        match &outcome {
            JobOutcome::Completed { model_used, metadata } => {
                let file = audio_files::fetch(&mut *tx, run.file_id)
                    .await?
                    .ok_or(JobError::NotFound(run.file_id))?;
                let started_at = file.transcription_started_at.unwrap_or(now);
                let duration_secs = ((now - started_at).num_milliseconds() as f64 / 1000.0).max(0.0);
                fenced(
                    audio_files::mark_completed(
                        &mut *tx,
                        run.file_id,
                        run.generation,
                        now,
                        duration_secs,
                        model_used,
                        &metadata.to_string(),
                    )
                    .await?,
                )?;
                tx.commit().await?;
                info!(
                    "Transcription of file {} completed in {:.1}s with {}",
                    run.file_id, duration_secs, model_used
                );
            }
            JobOutcome::Failed { error } => {
                fenced(audio_files::mark_failed(&mut *tx, run.file_id, run.generation, error, now).await?)?;
                tx.commit().await?;
                warn!("Transcription of file {} failed: {}", run.file_id, error);
            }
        }

        Ok(())
    }

    /// Count one failed attempt. `None` if the run is no longer current.
    pub async fn record_failed_attempt(&self, run: &JobRun) -> Result<Option<i64>, JobError> {
        let mut conn = self.sessions.session().await?;
        Ok(audio_files::bump_recovery_attempts(&mut conn, run.file_id, run.generation).await?)
    }

    /// Take ownership of an interrupted PROCESSING record, fencing out whatever
    /// worker held it. The takeover counts as a recovery attempt; returns the
    /// new run with the attempt count, or `None` if someone else got there
    /// first.
    pub async fn take_over(&self, file: &AudioFile) -> Result<Option<(JobRun, i64)>, JobError> {
        let mut conn = self.sessions.session().await?;
        let taken = audio_files::take_over(&mut conn, file.id, file.job_generation, Utc::now()).await?;
        Ok(taken.map(|(generation, attempts)| {
            (
                JobRun {
                    file_id: file.id,
                    generation,
                },
                attempts,
            )
        }))
    }

    pub async fn processing_jobs(&self) -> Result<Vec<AudioFile>, JobError> {
        let mut conn = self.sessions.session().await?;
        Ok(audio_files::list_by_status(&mut conn, TranscriptionStatus::Processing).await?)
    }

    /// Request cancellation of a running job. Returns false if nothing was
    /// running; the worker stops at its next batch boundary.
    pub async fn cancel(&self, file_id: i64) -> Result<bool, JobError> {
        let mut conn = self.sessions.session().await?;
        let rows = audio_files::cancel(&mut conn, file_id, CANCELLED_MESSAGE, Utc::now()).await?;
        if rows == 0 {
            audio_files::fetch(&mut conn, file_id)
                .await?
                .ok_or(JobError::NotFound(file_id))?;
            return Ok(false);
        }
        info!("Cancellation requested for file {}", file_id);
        Ok(true)
    }

    pub async fn status(&self, file_id: i64, stall: &StallTimeouts) -> Result<JobStatus, JobError> {
        let mut conn = self.sessions.session().await?;
        let file = audio_files::fetch(&mut conn, file_id)
            .await?
            .ok_or(JobError::NotFound(file_id))?;
        let segment_count = segments::count_for_file(&mut conn, file_id).await?;
        let speaker_count = speakers::count_for_file(&mut conn, file_id).await?;
        Ok(JobStatus::from_record(&file, segment_count, speaker_count, stall, Utc::now()))
    }

    /// Delete segments and speakers and reset the record to PENDING.
    /// Idempotent; any running worker is fenced out by the generation bump.
    pub async fn clear(&self, file_id: i64) -> Result<ClearSummary, JobError> {
        let mut tx = self.sessions.transaction().await?;
        // Writes first so the transaction holds the write lock before reading.
        let deleted_segments = segments::delete_for_file(&mut *tx, file_id).await?;
        let deleted_speakers = speakers::delete_for_file(&mut *tx, file_id).await?;
        let file = audio_files::fetch(&mut *tx, file_id)
            .await?
            .ok_or(JobError::NotFound(file_id))?;
        audio_files::reset_to_pending(&mut *tx, file_id).await?;
        tx.commit().await?;

        let mut cached = Vec::new();
        if let Some(path) = file.audio_transformation_path.as_deref() {
            cached.push(spans_cache_path(Path::new(path)));
            cached.push(Path::new(path).to_path_buf());
        }
        for path in cached {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed cached {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove cached {:?}: {}", path, e),
            }
        }

        info!(
            "Cleared file {}: {} segments, {} speakers deleted",
            file_id, deleted_segments, deleted_speakers
        );
        Ok(ClearSummary {
            deleted_segments,
            deleted_speakers,
        })
    }
}

/// Progress sink writing to the job record on behalf of one run
pub struct RecordProgressSink {
    state: TranscriptionStateMachine,
    run: JobRun,
}

impl RecordProgressSink {
    pub fn new(state: TranscriptionStateMachine, run: JobRun) -> Self {
        Self { state, run }
    }
}

#[async_trait]
impl ProgressSink for RecordProgressSink {
    async fn apply(&self, update: ProgressUpdate) -> Result<(), SinkError> {
        match self.state.report_progress(&self.run, update).await {
            Ok(()) => Ok(()),
            Err(JobError::Superseded) => Err(SinkError::Superseded),
            Err(JobError::ProgressRegression { stored, attempted }) => {
                Err(SinkError::Regression { stored, attempted })
            }
            Err(e) => Err(SinkError::Other(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::{FakeDiarizer, FakeEngine, Harness};
    use crate::transcribe::{RawSpan, SpeakerTurn, Stage};
    use std::sync::Arc;

    #[test]
    fn test_language_normalization() {
        assert_eq!(normalize_language(None), None);
        assert_eq!(normalize_language(Some("")), None);
        assert_eq!(normalize_language(Some("  ")), None);
        assert_eq!(normalize_language(Some("fi")), Some("fi".to_string()));
    }

    #[tokio::test]
    async fn test_start_on_missing_file() {
        let harness = Harness::new(vec![]).await;
        let err = harness
            .state()
            .start(999, &JobOptions::new(WhisperModel::Tiny))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_start_rejects_processing_without_touching_progress() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();

        let claim = state.start(file_id, &JobOptions::new(WhisperModel::Tiny)).await.unwrap();
        state
            .report_progress(&claim.run, ProgressUpdate::Advance { fraction: 0.3, stage: Stage::Transcribing })
            .await
            .unwrap();

        let err = state
            .start(file_id, &JobOptions::new(WhisperModel::Large))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning(_)));

        let status = harness.status(file_id).await;
        assert_eq!(status.progress, 0.3);
        assert_eq!(status.stage, "transcribing");
    }

    #[tokio::test]
    async fn test_concurrent_starts_have_one_winner() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();
        let options = JobOptions::new(WhisperModel::Tiny);

        let (a, b) = tokio::join!(state.start(file_id, &options), state.start(file_id, &options));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_regression_is_rejected_and_stale_run_is_superseded() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();
        let claim = state.start(file_id, &JobOptions::new(WhisperModel::Tiny)).await.unwrap();

        let advance = |fraction| ProgressUpdate::Advance { fraction, stage: Stage::Transcribing };
        state.report_progress(&claim.run, advance(0.5)).await.unwrap();
        let err = state.report_progress(&claim.run, advance(0.4)).await.unwrap_err();
        assert!(matches!(err, JobError::ProgressRegression { .. }));

        let stale = JobRun {
            file_id,
            generation: claim.run.generation - 1,
        };
        let err = state.report_progress(&stale, advance(0.9)).await.unwrap_err();
        assert!(matches!(err, JobError::Superseded));
        assert_eq!(harness.status(file_id).await.progress, 0.5);
    }

    #[tokio::test]
    async fn test_restart_from_zero_marks_the_reset() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();
        let claim = state.start(file_id, &JobOptions::new(WhisperModel::Tiny)).await.unwrap();
        let advance = ProgressUpdate::Advance {
            fraction: 0.4,
            stage: Stage::Transcribing,
        };
        state.report_progress(&claim.run, advance).await.unwrap();

        state.restart_from_zero(&claim.run).await.unwrap();

        let status = harness.status(file_id).await;
        assert_eq!(status.stage, "restarting");
        assert_eq!(status.progress, 0.0);
        assert!(!status.is_stuck);
        assert_eq!(
            Phase::infer(&status.stage, status.progress),
            Phase::Initializing
        );
    }

    #[tokio::test]
    async fn test_language_round_trips_through_start() {
        let harness = Harness::new(vec![]).await;
        let state = harness.state();

        let auto = harness.add_wav_file("auto.wav").await;
        let options = JobOptions::new(WhisperModel::Tiny).with_language(Some(""));
        state.start(auto, &options).await.unwrap();
        assert_eq!(harness.status(auto).await.language, None);

        let finnish = harness.add_wav_file("fi.wav").await;
        let options = JobOptions::new(WhisperModel::Tiny).with_language(Some("fi"));
        state.start(finnish, &options).await.unwrap();
        assert_eq!(harness.status(finnish).await.language.as_deref(), Some("fi"));
    }

    #[tokio::test]
    async fn test_finalize_failure_and_cancel() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();

        let claim = state.start(file_id, &JobOptions::new(WhisperModel::Tiny)).await.unwrap();
        assert!(state.cancel(file_id).await.unwrap());
        assert!(!state.cancel(file_id).await.unwrap());

        let status = harness.status(file_id).await;
        assert_eq!(status.status, TranscriptionStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some(CANCELLED_MESSAGE));

        // The cancelled run can no longer finalize.
        let err = state
            .finalize(&claim.run, JobOutcome::Failed { error: "late".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Superseded));
        assert!(matches!(state.cancel(404).await, Err(JobError::NotFound(404))));
    }

    #[tokio::test]
    async fn test_clear_resets_and_is_idempotent() {
        let harness = Harness::new(vec![RawSpan::new(0.0, 5.0, "Hello")]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        harness.run_to_completion(file_id, JobOptions::new(WhisperModel::Tiny)).await;
        assert_eq!(harness.status(file_id).await.segment_count, 1);

        let summary = harness.state().clear(file_id).await.unwrap();
        assert_eq!(summary.deleted_segments, 1);

        let status = harness.status(file_id).await;
        assert_eq!(status.status, TranscriptionStatus::Pending);
        assert_eq!(status.progress, 0.0);
        assert_eq!(status.stage, "pending");
        assert_eq!(status.segment_count, 0);
        assert!(!status.can_resume);
        assert!(status.model_used.is_none());

        let again = harness.state().clear(file_id).await.unwrap();
        assert_eq!(again, ClearSummary::default());
        assert!(matches!(harness.state().clear(12345).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_deletes_speakers() {
        let turns = vec![
            SpeakerTurn::new("SPEAKER_00", 0.0, 6.0),
            SpeakerTurn::new("SPEAKER_01", 6.0, 10.0),
        ];
        let harness = Harness::build(
            FakeEngine::new(vec![RawSpan::new(0.0, 5.0, "Hello"), RawSpan::new(5.0, 10.0, "World")]),
            Some(Arc::new(FakeDiarizer::succeeding(turns))),
            3,
        )
        .await;
        let file_id = harness.add_wav_file("a.wav").await;
        let options = JobOptions::new(WhisperModel::Tiny).with_diarization(true);
        assert_eq!(harness.run_to_completion(file_id, options).await.speaker_count, 2);

        let summary = harness.state().clear(file_id).await.unwrap();
        assert_eq!(summary.deleted_segments, 2);
        assert_eq!(summary.deleted_speakers, 2);

        let mut conn = harness.sessions().session().await.unwrap();
        assert_eq!(speakers::count_for_file(&mut conn, file_id).await.unwrap(), 0);
        assert_eq!(harness.status(file_id).await.speaker_count, 0);
    }

    #[tokio::test]
    async fn test_clear_leaves_other_files_alone() {
        let harness = Harness::new(vec![RawSpan::new(0.0, 5.0, "Hello")]).await;
        let a = harness.add_wav_file("a.wav").await;
        let b = harness.add_wav_file("b.wav").await;
        harness.run_to_completion(a, JobOptions::new(WhisperModel::Tiny)).await;
        harness.run_to_completion(b, JobOptions::new(WhisperModel::Tiny)).await;

        harness.state().clear(a).await.unwrap();

        let status_b = harness.status(b).await;
        assert_eq!(status_b.status, TranscriptionStatus::Completed);
        assert_eq!(status_b.segment_count, 1);
        assert_eq!(status_b.progress, 1.0);
    }

    #[tokio::test]
    async fn test_stuck_detection_uses_phase_timeout() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let state = harness.state();
        state.start(file_id, &JobOptions::new(WhisperModel::Tiny)).await.unwrap();

        let twenty_minutes_ago = Utc::now() - chrono::Duration::minutes(20);
        harness
            .set_liveness(file_id, "loading_model", 0.005, twenty_minutes_ago)
            .await;
        assert!(!harness.status(file_id).await.is_stuck);

        harness
            .set_liveness(file_id, "transcribing", 0.4, twenty_minutes_ago)
            .await;
        assert!(harness.status(file_id).await.is_stuck);
    }
}
