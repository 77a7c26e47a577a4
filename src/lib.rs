pub mod config;
pub mod db;
pub mod job;
pub mod transcribe;

pub use config::Settings;
pub use job::{JobError, JobOptions, JobStatus, StartOutcome, TranscriptionService};
