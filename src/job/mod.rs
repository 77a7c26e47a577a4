//! Resumable transcription jobs.
//!
//! [`TranscriptionService`] is the calling surface: it wires the state
//! machine, the pipeline, the worker runner and recovery together over one
//! [`SessionFactory`].

pub mod assemble;
pub mod checkpoint;
pub mod error;
pub mod pipeline;
pub mod recovery;
pub mod runner;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use assemble::{AssemblyReport, SegmentAssembler};
pub use checkpoint::Checkpoint;
pub use error::{ErrorKind, JobError};
pub use pipeline::{DiarizationSummary, JobMetadata, Pipeline};
pub use recovery::{RecoveryAction, RecoveryManager, RecoveryPolicy, RecoveryReport};
pub use runner::{JobRunner, StartOutcome};
pub use state::{ClearSummary, JobOptions, JobRun, JobStatus, TranscriptionStateMachine};

use crate::config::{Settings, StallTimeouts};
use crate::db::audio_files::{self, NewAudioFile};
use crate::db::{DbPool, SegmentRecord, SessionFactory, Speaker, projects, segments, speakers};
use crate::transcribe::normalize::probe_wav_duration;
use crate::transcribe::{AudioNormalizer, NormalizeError, SpeakerDiarizer, SpeechEngine};

pub struct TranscriptionService {
    sessions: SessionFactory,
    state: TranscriptionStateMachine,
    runner: Arc<JobRunner>,
    recovery: Arc<RecoveryManager>,
    stall: StallTimeouts,
}

impl TranscriptionService {
    pub fn new(
        settings: &Settings,
        pool: DbPool,
        engine: Arc<dyn SpeechEngine>,
        diarizer: Option<Arc<dyn SpeakerDiarizer>>,
    ) -> Self {
        let sessions = SessionFactory::new(pool);
        let state = TranscriptionStateMachine::new(sessions.clone());

        let pipeline = Pipeline::new(
            state.clone(),
            AudioNormalizer::new(settings.audio_cache_dir.clone(), settings.ffmpeg_path.clone()),
            engine,
            diarizer,
            SegmentAssembler::new(sessions.clone(), settings.segment_batch_size),
            settings.inference_threads(),
        );
        let policy = RecoveryPolicy {
            max_attempts: settings.max_recovery_attempts,
            retry_delay: settings.retry_delay,
        };
        let runner = Arc::new(JobRunner::new(state.clone(), pipeline, policy.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            state.clone(),
            Arc::clone(&runner),
            settings.stall,
            policy,
        ));

        Self {
            sessions,
            state,
            runner,
            recovery,
            stall: settings.stall,
        }
    }

    pub fn state(&self) -> &TranscriptionStateMachine {
        &self.state
    }

    pub fn recovery(&self) -> Arc<RecoveryManager> {
        Arc::clone(&self.recovery)
    }

    pub(crate) fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Create the PENDING job record for an audio file, creating the project
    /// on first use.
    pub async fn register_audio_file(&self, project: &str, path: &Path) -> Result<i64, JobError> {
        if !path.exists() {
            return Err(NormalizeError::SourceNotFound(path.to_path_buf()).into());
        }

        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "unknown".to_string());
        let duration = if format == "wav" {
            probe_wav_duration(path).ok()
        } else {
            None
        };
        let original_filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut conn = self.sessions.session().await?;
        let project_id = projects::ensure(&mut conn, project).await?;
        let file_id = audio_files::insert(
            &mut conn,
            &NewAudioFile {
                project_id,
                file_path: path.display().to_string(),
                original_filename,
                format,
                duration,
            },
        )
        .await?;

        info!("Registered {:?} as audio file {} in project {:?}", path, file_id, project);
        Ok(file_id)
    }

    pub async fn start(&self, file_id: i64, options: JobOptions) -> Result<StartOutcome, JobError> {
        self.runner.start(file_id, options).await
    }

    pub async fn status(&self, file_id: i64) -> Result<JobStatus, JobError> {
        self.state.status(file_id, &self.stall).await
    }

    pub async fn clear(&self, file_id: i64) -> Result<ClearSummary, JobError> {
        self.state.clear(file_id).await
    }

    pub async fn cancel(&self, file_id: i64) -> Result<bool, JobError> {
        self.state.cancel(file_id).await
    }

    /// Segments of a file in sequence order, with speaker labels
    pub async fn segments(&self, file_id: i64) -> Result<Vec<SegmentRecord>, JobError> {
        let mut conn = self.sessions.session().await?;
        audio_files::fetch(&mut conn, file_id)
            .await?
            .ok_or(JobError::NotFound(file_id))?;
        Ok(segments::list_for_file(&mut conn, file_id).await?)
    }

    /// Speakers attributed to a file, ordered by label
    pub async fn speakers(&self, file_id: i64) -> Result<Vec<Speaker>, JobError> {
        let mut conn = self.sessions.session().await?;
        audio_files::fetch(&mut conn, file_id)
            .await?
            .ok_or(JobError::NotFound(file_id))?;
        Ok(speakers::list_for_file(&mut conn, file_id).await?)
    }

    /// Wait for the file's worker, if any, to finish
    pub async fn wait(&self, file_id: i64) {
        self.runner.wait(file_id).await
    }
}
