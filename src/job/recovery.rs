//! Reconciling jobs whose worker is gone: at startup, and whenever the stall
//! check finds a job that stopped reporting progress.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::error::{ErrorKind, JobError};
use super::runner::JobRunner;
use super::state::{AttemptMode, Claim, JobOutcome, JobRun, TranscriptionStateMachine, is_stuck, recovery_mode};
use crate::config::StallTimeouts;
use crate::db::{AudioFile, TranscriptionStatus};

/// What a worker does after an attempt fails
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RecoveryPolicy {
    /// Returns the mode of the next attempt, or `None` when the worker should
    /// stop (job finalized as failed, or no longer ours).
    pub async fn after_failed_attempt(
        &self,
        state: &TranscriptionStateMachine,
        run: &JobRun,
        error: &JobError,
    ) -> Result<Option<AttemptMode>, JobError> {
        match error.kind() {
            ErrorKind::Superseded => {
                info!(
                    "Run {} of file {} was superseded, worker stopping",
                    run.generation, run.file_id
                );
                Ok(None)
            }
            ErrorKind::Input => {
                fail(state, run, error.to_string()).await?;
                Ok(None)
            }
            ErrorKind::Transient | ErrorKind::CorruptCheckpoint => {
                let Some(attempts) = state.record_failed_attempt(run).await? else {
                    return Ok(None);
                };
                if attempts > self.max_attempts as i64 {
                    fail(
                        state,
                        run,
                        format!("Giving up after {} failed recovery attempts: {}", attempts, error),
                    )
                    .await?;
                    return Ok(None);
                }

                warn!(
                    "Attempt for file {} failed ({}); recovery attempt {}/{}",
                    run.file_id, error, attempts, self.max_attempts
                );
                if !self.retry_delay.is_zero() {
                    tokio::time::sleep(self.retry_delay).await;
                }

                let mode = match error.kind() {
                    ErrorKind::CorruptCheckpoint => AttemptMode::Fresh,
                    // This failure was already counted; an unreadable
                    // checkpoint just means starting over.
                    _ => recovery_mode(&state.fetch(run.file_id).await?).unwrap_or(AttemptMode::Fresh),
                };
                Ok(Some(mode))
            }
        }
    }
}

async fn fail(state: &TranscriptionStateMachine, run: &JobRun, error: String) -> Result<(), JobError> {
    match state.finalize(run, JobOutcome::Failed { error }).await {
        Ok(()) | Err(JobError::Superseded) => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Resumed,
    Restarted,
    /// Attempt budget exhausted; finalized as failed
    Abandoned,
    /// Someone else took over first, or a worker is still running
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    pub resumed: usize,
    pub restarted: usize,
    pub abandoned: usize,
    pub skipped: usize,
}

impl RecoveryReport {
    fn record(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::Resumed => self.resumed += 1,
            RecoveryAction::Restarted => self.restarted += 1,
            RecoveryAction::Abandoned => self.abandoned += 1,
            RecoveryAction::Skipped => self.skipped += 1,
        }
    }

    pub fn recovered(&self) -> usize {
        self.resumed + self.restarted
    }
}

pub struct RecoveryManager {
    state: TranscriptionStateMachine,
    runner: Arc<JobRunner>,
    stall: StallTimeouts,
    policy: RecoveryPolicy,
}

impl RecoveryManager {
    pub fn new(
        state: TranscriptionStateMachine,
        runner: Arc<JobRunner>,
        stall: StallTimeouts,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            state,
            runner,
            stall,
            policy,
        }
    }

    /// Pick up every job a previous process left in PROCESSING.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, JobError> {
        let jobs = self.state.processing_jobs().await?;
        if !jobs.is_empty() {
            info!("Startup recovery: {} jobs left in PROCESSING", jobs.len());
        }

        let mut report = RecoveryReport::default();
        for file in jobs {
            report.examined += 1;
            if self.runner.is_active(file.id) {
                report.record(RecoveryAction::Skipped);
                continue;
            }
            let action = self.recover_one(&file).await;
            report.record(action);
        }
        Ok(report)
    }

    /// Treat every PROCESSING job silent for longer than its phase allows as
    /// crashed.
    pub async fn check_stalls(&self, now: DateTime<Utc>) -> Result<RecoveryReport, JobError> {
        let mut report = RecoveryReport::default();

        for file in self.state.processing_jobs().await? {
            report.examined += 1;
            if !is_stuck(&file, &self.stall, now) {
                continue;
            }
            warn!(
                "File {} stalled in stage {} at {:.3} (last progress {:?})",
                file.id, file.transcription_stage, file.transcription_progress, file.last_progress_at
            );
            if self.runner.abort(file.id) {
                info!("Aborted the stalled local worker of file {}", file.id);
            }
            let action = self.recover_one(&file).await;
            report.record(action);
        }
        Ok(report)
    }

    async fn recover_one(&self, file: &AudioFile) -> RecoveryAction {
        match self.handle_interrupted(file).await {
            Ok(action) => action,
            Err(e) => {
                error!("Recovery of file {} failed: {}", file.id, e);
                RecoveryAction::Skipped
            }
        }
    }

    /// Take over an interrupted job and either resume it, restart it, or give
    /// up on it.
    pub async fn handle_interrupted(&self, file: &AudioFile) -> Result<RecoveryAction, JobError> {
        let Some((run, attempts)) = self.state.take_over(file).await? else {
            debug!("File {} was taken over elsewhere", file.id);
            return Ok(RecoveryAction::Skipped);
        };

        if attempts > self.policy.max_attempts as i64 {
            fail(
                &self.state,
                &run,
                format!(
                    "Recovery abandoned after {} attempts (interrupted {} times)",
                    attempts - 1,
                    file.interruption_count + 1
                ),
            )
            .await?;
            return Ok(RecoveryAction::Abandoned);
        }

        let mode = match recovery_mode(file) {
            Ok(mode) => mode,
            Err(e) => match self.policy.after_failed_attempt(&self.state, &run, &e).await? {
                Some(mode) => mode,
                None => {
                    let current = self.state.fetch(file.id).await?;
                    return Ok(if current.transcription_status == TranscriptionStatus::Failed {
                        RecoveryAction::Abandoned
                    } else {
                        RecoveryAction::Skipped
                    });
                }
            },
        };
        let action = match &mode {
            AttemptMode::Resume(checkpoint) => {
                info!(
                    "Resuming interrupted file {} from segment {}",
                    file.id, checkpoint.last_segment_index
                );
                RecoveryAction::Resumed
            }
            AttemptMode::Fresh => {
                info!("Restarting interrupted file {} from zero", file.id);
                RecoveryAction::Restarted
            }
        };

        self.runner.spawn(Claim { run, mode });
        Ok(action)
    }

    /// Periodic stall check; runs until the surrounding task is dropped.
    pub async fn run_watchdog(&self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.check_stalls(Utc::now()).await {
                Ok(report) if report.recovered() + report.abandoned > 0 => info!(
                    "Watchdog: {} resumed, {} restarted, {} abandoned",
                    report.resumed, report.restarted, report.abandoned
                ),
                Ok(report) => debug!("Watchdog: {} running jobs healthy", report.examined),
                Err(e) => error!("Watchdog check failed: {}", e),
            }
        }
    }
}
