//! Progress reporting for a running job.
//!
//! The engine and every pipeline step report through a [`ProgressTracker`].
//! The tracker enforces monotonicity and forwards accepted updates over a
//! channel to a single [`ProgressWriter`] per run, so updates reach the job
//! record in the order they were produced.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::StallTimeouts;

/// Fractions at or below this still count as "not started" for phase inference
pub const INIT_PROGRESS_THRESHOLD: f64 = 0.01;

/// A slice of the overall `[0.0, 1.0]` range owned by one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub start: f64,
    pub end: f64,
}

impl Band {
    /// Map a stage-local fraction into the overall range
    pub fn at(&self, local: f64) -> f64 {
        let local = if local.is_finite() { local.clamp(0.0, 1.0) } else { 0.0 };
        self.start + (self.end - self.start) * local
    }
}

pub const NORMALIZING_BAND: Band = Band { start: 0.0, end: 0.004 };
pub const LOADING_MODEL_BAND: Band = Band { start: 0.004, end: INIT_PROGRESS_THRESHOLD };
pub const TRANSCRIBING_BAND: Band = Band { start: INIT_PROGRESS_THRESHOLD, end: 0.80 };
pub const SAVING_BAND: Band = Band { start: 0.80, end: 0.90 };
pub const DIARIZING_BAND: Band = Band { start: 0.90, end: 0.98 };
pub const FINALIZING_BAND: Band = Band { start: 0.98, end: 0.99 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    /// Partial output of an earlier attempt was discarded
    Restarting,
    NormalizingAudio,
    LoadingModel,
    Transcribing,
    SavingSegments,
    Diarizing,
    Finalizing,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Restarting => "restarting",
            Stage::NormalizingAudio => "normalizing_audio",
            Stage::LoadingModel => "loading_model",
            Stage::Transcribing => "transcribing",
            Stage::SavingSegments => "saving_segments",
            Stage::Diarizing => "diarizing",
            Stage::Finalizing => "finalizing",
            Stage::Completed => "completed",
        }
    }

    pub fn band(&self) -> Band {
        match self {
            Stage::Pending | Stage::Restarting => Band { start: 0.0, end: 0.0 },
            Stage::NormalizingAudio => NORMALIZING_BAND,
            Stage::LoadingModel => LOADING_MODEL_BAND,
            Stage::Transcribing => TRANSCRIBING_BAND,
            Stage::SavingSegments => SAVING_BAND,
            Stage::Diarizing => DIARIZING_BAND,
            Stage::Finalizing => FINALIZING_BAND,
            Stage::Completed => Band { start: 1.0, end: 1.0 },
        }
    }

    /// Stages that belong to the initialization phase
    pub fn is_initializing(stage: &str) -> bool {
        matches!(stage, "pending" | "restarting" | "normalizing_audio" | "loading_model")
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stall tolerance applies to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Model loading and other setup; long silences are normal
    Initializing,
    /// Inference and post-processing; updates arrive frequently
    Active,
}

impl Phase {
    pub fn infer(stage: &str, progress: f64) -> Phase {
        if progress > INIT_PROGRESS_THRESHOLD || !Stage::is_initializing(stage) {
            Phase::Active
        } else {
            Phase::Initializing
        }
    }

    pub fn timeout(&self, timeouts: &StallTimeouts) -> Duration {
        match self {
            Phase::Initializing => timeouts.initializing,
            Phase::Active => timeouts.active,
        }
    }
}

/// Lowest fraction a resumed run may report, given how many segments were
/// already committed. Committed segments imply inference had finished, so the
/// floor lands inside the segment-saving band.
pub fn resume_floor(committed: i64, estimated_total: i64) -> f64 {
    if committed <= 0 || estimated_total <= 0 {
        return 0.0;
    }
    let ratio = committed as f64 / estimated_total.max(committed) as f64;
    SAVING_BAND.at(ratio)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressUpdate {
    /// New fraction and stage
    Advance { fraction: f64, stage: Stage },
    /// Liveness and stage label only; the stored fraction stays as is
    Heartbeat { stage: Stage },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Job run is no longer current")]
    Superseded,
    #[error("Progress regression rejected: stored {stored:.4}, attempted {attempted:.4}")]
    Regression { stored: f64, attempted: f64 },
    #[error("{0}")]
    Other(String),
}

/// Destination for progress updates (the job record in production)
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn apply(&self, update: ProgressUpdate) -> Result<(), SinkError>;
}

#[derive(Debug)]
enum Message {
    Update(ProgressUpdate),
    Close,
}

#[derive(Debug)]
struct TrackerState {
    last: f64,
    floor: f64,
    stage: Stage,
    closed: bool,
}

/// Cheap to clone; every clone feeds the same writer.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
    tx: mpsc::UnboundedSender<Message>,
}

impl ProgressTracker {
    /// Create a tracker and the writer that drains it. `floor` is zero for a
    /// fresh run and the resume floor for a resumed one.
    pub fn channel(sink: Arc<dyn ProgressSink>, floor: f64) -> (ProgressTracker, ProgressWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let floor = if floor.is_finite() { floor.clamp(0.0, 1.0) } else { 0.0 };

        let tracker = ProgressTracker {
            state: Arc::new(Mutex::new(TrackerState {
                last: floor,
                floor,
                stage: Stage::Pending,
                closed: false,
            })),
            tx,
        };

        (tracker, ProgressWriter { rx, sink })
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report an overall fraction. Returns whether it was accepted.
    ///
    /// A fraction below the last accepted one is rejected and logged. On a
    /// resumed run, fractions below the resume floor are expected while
    /// earlier stages replay; those are forwarded as heartbeats so the job
    /// keeps looking alive.
    pub fn emit(&self, fraction: f64, stage: Stage) -> bool {
        if !fraction.is_finite() {
            warn!("Ignoring non-finite progress value for stage {}", stage);
            return false;
        }
        let fraction = fraction.clamp(0.0, 1.0);

        let mut state = self.lock();
        if state.closed {
            return false;
        }

        if fraction < state.last {
            if fraction < state.floor {
                state.stage = stage;
                let _ = self.tx.send(Message::Update(ProgressUpdate::Heartbeat { stage }));
            } else {
                warn!(
                    "Rejected progress regression {:.4} -> {:.4} (stage {})",
                    state.last, fraction, stage
                );
            }
            return false;
        }

        state.last = fraction;
        state.stage = stage;
        // Sent under the lock so channel order matches acceptance order.
        let _ = self.tx.send(Message::Update(ProgressUpdate::Advance { fraction, stage }));
        true
    }

    /// Report a stage-local fraction, mapped through the stage's band
    pub fn emit_in(&self, stage: Stage, local: f64) -> bool {
        self.emit(stage.band().at(local), stage)
    }

    /// Mark the start of a stage
    pub fn enter(&self, stage: Stage) -> bool {
        self.emit(stage.band().start, stage)
    }

    pub fn current(&self) -> f64 {
        self.lock().last
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    pub fn phase(&self) -> Phase {
        let state = self.lock();
        Phase::infer(state.stage.as_str(), state.last)
    }

    /// Stop accepting updates and tell the writer to finish once everything
    /// queued so far is applied.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            let _ = self.tx.send(Message::Close);
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriterSummary {
    pub applied: usize,
    pub rejected: usize,
    pub superseded: bool,
}

/// Single consumer applying updates for one run, in order
pub struct ProgressWriter {
    rx: mpsc::UnboundedReceiver<Message>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressWriter {
    pub async fn run(mut self) -> WriterSummary {
        debug!("Progress writer started");
        let mut summary = WriterSummary::default();

        while let Some(message) = self.rx.recv().await {
            let update = match message {
                Message::Update(update) => update,
                Message::Close => break,
            };

            match self.sink.apply(update).await {
                Ok(()) => summary.applied += 1,
                Err(SinkError::Superseded) => {
                    debug!("Run superseded, progress writer stopping");
                    summary.superseded = true;
                    break;
                }
                Err(e) => {
                    warn!("Progress update not applied: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        debug!(
            "Progress writer finished ({} applied, {} rejected)",
            summary.applied, summary.rejected
        );
        summary
    }
}
