//! Fixtures shared by the job tests: a fake engine and diarizer, tone WAVs,
//! and a service wired to a throwaway database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use super::state::{JobOptions, JobStatus, TranscriptionStateMachine};
use super::{StartOutcome, TranscriptionService};
use crate::config::Settings;
use crate::db::{SegmentRecord, SessionFactory, init_db};
use crate::transcribe::progress::tests::RecordingSink;
use crate::transcribe::{
    DiarizeError, EngineError, EngineOutput, EngineRequest, ProgressTracker, RawSpan, SpeakerDiarizer,
    SpeakerTurn, SpeechEngine, Stage, WhisperModel,
};

/// One second of a 440Hz tone, already 16kHz mono
pub(crate) fn write_wav(path: &Path) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..16_000 {
        let t = i as f32 / 16_000.0;
        let sample = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.3;
        writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Returns a fixed span list and counts how often it was asked to work.
pub(crate) struct FakeEngine {
    spans: Vec<RawSpan>,
    failing_loads: AtomicUsize,
    held: AtomicBool,
    loads: AtomicUsize,
    transcriptions: AtomicUsize,
}

impl FakeEngine {
    pub fn new(spans: Vec<RawSpan>) -> Self {
        Self {
            spans,
            failing_loads: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            transcriptions: AtomicUsize::new(0),
        }
    }

    /// The first `n` model loads fail with a transient error
    pub fn failing_loads(self, n: usize) -> Self {
        self.failing_loads.store(n, Ordering::SeqCst);
        self
    }

    /// Model loads block until [`FakeEngine::release`], keeping workers alive
    pub fn hold_loads(self) -> Self {
        self.held.store(true, Ordering::SeqCst);
        self
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn transcriptions(&self) -> usize {
        self.transcriptions.load(Ordering::SeqCst)
    }
}

impl SpeechEngine for FakeEngine {
    fn load_model(&self, model: WhisperModel, progress: &ProgressTracker) -> Result<String, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        while self.held.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.failing_loads.load(Ordering::SeqCst) > 0 {
            self.failing_loads.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Init("out of memory".to_string()));
        }
        progress.emit_in(Stage::LoadingModel, 0.5);
        Ok(format!("fake-{}", model.as_str()))
    }

    fn transcribe(
        &self,
        samples: &[f32],
        _request: &EngineRequest,
        progress: &ProgressTracker,
    ) -> Result<EngineOutput, EngineError> {
        assert!(!samples.is_empty());
        self.transcriptions.fetch_add(1, Ordering::SeqCst);
        progress.emit_in(Stage::Transcribing, 0.5);
        Ok(EngineOutput {
            spans: self.spans.clone(),
            detected_language: Some("en".to_string()),
        })
    }
}

pub(crate) enum FakeDiarizer {
    Succeeding(Vec<SpeakerTurn>),
    Failing(String),
}

impl FakeDiarizer {
    pub fn succeeding(turns: Vec<SpeakerTurn>) -> Self {
        FakeDiarizer::Succeeding(turns)
    }

    pub fn failing(reason: &str) -> Self {
        FakeDiarizer::Failing(reason.to_string())
    }
}

#[async_trait]
impl SpeakerDiarizer for FakeDiarizer {
    async fn diarize(&self, _audio_path: &Path) -> Result<Vec<SpeakerTurn>, DiarizeError> {
        match self {
            FakeDiarizer::Succeeding(turns) => Ok(turns.clone()),
            FakeDiarizer::Failing(reason) => Err(DiarizeError::Failed(reason.clone())),
        }
    }
}

/// A tracker whose updates land in memory instead of on a job record
pub(crate) fn recording_tracker(floor: f64) -> (ProgressTracker, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let (tracker, writer) = ProgressTracker::channel(sink.clone(), floor);
    tokio::spawn(writer.run());
    (tracker, sink)
}

pub(crate) struct Harness {
    pub dir: TempDir,
    pub service: TranscriptionService,
    pub engine: Arc<FakeEngine>,
}

impl Harness {
    pub async fn new(spans: Vec<RawSpan>) -> Self {
        Self::build(FakeEngine::new(spans), None, 3).await
    }

    pub async fn build(
        engine: FakeEngine,
        diarizer: Option<Arc<dyn SpeakerDiarizer>>,
        max_attempts: u32,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database_url = format!("sqlite:{}", dir.path().join("jobs.db").display());
        let cache_dir = dir.path().join("cache").display().to_string();
        let max_attempts = max_attempts.to_string();

        let settings = Settings::from_lookup(|key| match key {
            "DATABASE_URL" => Some(database_url.clone()),
            "AUDIO_CACHE_DIR" => Some(cache_dir.clone()),
            "MAX_RECOVERY_ATTEMPTS" => Some(max_attempts.clone()),
            "RECOVERY_RETRY_DELAY_SECS" => Some("0".to_string()),
            "WHISPER_THREADS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();

        let pool = init_db(&settings.database_url).await.unwrap();
        let engine = Arc::new(engine);
        let service = TranscriptionService::new(&settings, pool, engine.clone(), diarizer);

        Self { dir, service, engine }
    }

    pub fn state(&self) -> &TranscriptionStateMachine {
        self.service.state()
    }

    pub fn sessions(&self) -> SessionFactory {
        self.service.state().sessions().clone()
    }

    /// Write a tone WAV into the temp dir and register it
    pub async fn add_wav_file(&self, name: &str) -> i64 {
        let path = self.dir.path().join(name);
        write_wav(&path);
        self.service.register_audio_file("test", &path).await.unwrap()
    }

    pub async fn status(&self, file_id: i64) -> JobStatus {
        self.service.status(file_id).await.unwrap()
    }

    pub async fn segments(&self, file_id: i64) -> Vec<SegmentRecord> {
        self.service.segments(file_id).await.unwrap()
    }

    pub async fn run_to_completion(&self, file_id: i64, options: JobOptions) -> JobStatus {
        let outcome = self.service.start(file_id, options).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Accepted { .. }), "{outcome:?}");
        self.service.wait(file_id).await;
        self.status(file_id).await
    }

    /// Rewrite the liveness fields a worker would normally maintain
    pub async fn set_liveness(&self, file_id: i64, stage: &str, progress: f64, at: DateTime<Utc>) {
        sqlx::query(
            "UPDATE audio_files SET transcription_stage = ?, transcription_progress = ?, last_progress_at = ? WHERE id = ?",
        )
        .bind(stage)
        .bind(progress)
        .bind(at)
        .bind(file_id)
        .execute(self.sessions().pool())
        .await
        .unwrap();
    }

    pub async fn execute(&self, sql: &str, file_id: i64) {
        sqlx::query(sql)
            .bind(file_id)
            .execute(self.sessions().pool())
            .await
            .unwrap();
    }
}
