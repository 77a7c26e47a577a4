use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::error::JobError;
use super::pipeline::Pipeline;
use super::recovery::RecoveryPolicy;
use super::state::{Claim, JobOptions, TranscriptionStateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The record is PROCESSING and a worker has been spawned
    Accepted { generation: i64 },
    AlreadyRunning,
    NotFound,
}

struct ActiveJob {
    generation: i64,
    handle: JoinHandle<()>,
}

/// Spawns one worker task per accepted job and drives its attempts.
pub struct JobRunner {
    state: TranscriptionStateMachine,
    pipeline: Pipeline,
    policy: RecoveryPolicy,
    active: DashMap<i64, ActiveJob>,
}

impl JobRunner {
    pub fn new(state: TranscriptionStateMachine, pipeline: Pipeline, policy: RecoveryPolicy) -> Self {
        Self {
            state,
            pipeline,
            policy,
            active: DashMap::new(),
        }
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Claim the record and hand it to a worker. Returns once the claim is
    /// committed, not when transcription finishes.
    pub async fn start(self: &Arc<Self>, file_id: i64, options: JobOptions) -> Result<StartOutcome, JobError> {
        match self.state.start(file_id, &options).await {
            Ok(claim) => {
                let generation = claim.run.generation;
                self.spawn(claim);
                Ok(StartOutcome::Accepted { generation })
            }
            Err(JobError::NotFound(_)) => Ok(StartOutcome::NotFound),
            Err(JobError::AlreadyRunning(_)) => {
                info!("Transcription of file {} is already running", file_id);
                Ok(StartOutcome::AlreadyRunning)
            }
            Err(e) => Err(e),
        }
    }

    pub fn spawn(self: &Arc<Self>, claim: Claim) {
        let runner = Arc::clone(self);
        let file_id = claim.run.file_id;
        let generation = claim.run.generation;

        let handle = tokio::spawn(async move {
            runner.drive(claim).await;
            runner
                .active
                .remove_if(&file_id, |_, job| job.generation == generation);
        });

        // Replacing an older entry detaches its task; that worker is already
        // fenced out by the generation change.
        self.active.insert(file_id, ActiveJob { generation, handle });
    }

    pub fn is_active(&self, file_id: i64) -> bool {
        self.active
            .get(&file_id)
            .map(|job| !job.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the local worker of `file_id`, if there is one. Returns whether a
    /// worker was stopped.
    pub fn abort(&self, file_id: i64) -> bool {
        match self.active.remove(&file_id) {
            Some((_, job)) => {
                let running = !job.handle.is_finished();
                job.handle.abort();
                running
            }
            None => false,
        }
    }

    /// Wait until no worker is running for `file_id`.
    pub async fn wait(&self, file_id: i64) {
        while let Some((_, job)) = self.active.remove(&file_id) {
            if let Err(e) = job.handle.await {
                warn!("Worker for file {} ended abnormally: {}", file_id, e);
            }
        }
    }

    async fn drive(&self, claim: Claim) {
        let Claim { run, mut mode } = claim;

        loop {
            match self.pipeline.run_attempt(&run, mode).await {
                Ok(report) => {
                    info!(
                        "File {} transcribed: {} segments (resumed: {})",
                        run.file_id, report.metadata.segment_count, report.metadata.resumed
                    );
                    return;
                }
                Err(e) => match self.policy.after_failed_attempt(&self.state, &run, &e).await {
                    Ok(Some(next)) => mode = next,
                    Ok(None) => return,
                    Err(record_err) => {
                        error!(
                            "Could not record failure of file {} ({}): {}",
                            run.file_id, e, record_err
                        );
                        return;
                    }
                },
            }
        }
    }
}
