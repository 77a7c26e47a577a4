//! Command-line interface over the job service.

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use transcribe_jobs::db::TranscriptionStatus;
use transcribe_jobs::job::{JobOptions, StartOutcome, TranscriptionService};
use transcribe_jobs::transcribe::{ExportFormat, WhisperModel, render};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resumable transcription jobs over a SQLite job store
#[derive(Parser, Debug)]
#[command(name = "transcribe-jobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register audio files as PENDING jobs
    Import {
        /// Project the files belong to (created if missing)
        #[arg(long, default_value = "default")]
        project: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Start (or resume) transcription of a file and follow its progress
    Transcribe {
        file_id: i64,
        /// Whisper model: tiny, base, small, medium, large
        #[arg(long, short, default_value = "small")]
        model: WhisperModel,
        /// ISO 639-1 language code; omit to auto-detect
        #[arg(long, short)]
        language: Option<String>,
        /// Attribute segments to speakers
        #[arg(long)]
        diarize: bool,
    },

    /// Show the job record of a file
    Status {
        file_id: i64,
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a file's segments
    Segments {
        file_id: i64,
        /// Output format: text, srt, vtt, json
        #[arg(long, short, default_value = "text")]
        format: ExportFormat,
        /// Write to a file instead of stdout; the format's extension is
        /// added when the path has none
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List the speakers attributed to a file
    Speakers { file_id: i64 },

    /// Delete a file's transcript and reset its job to PENDING
    Clear { file_id: i64 },

    /// Request cancellation of a running job
    Cancel { file_id: i64 },

    /// Recover interrupted jobs, then watch for stalls until Ctrl-C
    Worker {
        /// Seconds between stall checks
        #[arg(long, default_value = "60")]
        interval: u64,
    },
}

pub async fn run(command: Commands, service: TranscriptionService) -> anyhow::Result<()> {
    match command {
        Commands::Import { project, paths } => {
            for path in paths {
                let file_id = service
                    .register_audio_file(&project, &path)
                    .await
                    .with_context(|| format!("Failed to import {:?}", path))?;
                println!("{}\t{}", file_id, path.display());
            }
        }

        Commands::Transcribe {
            file_id,
            model,
            language,
            diarize,
        } => {
            let options = JobOptions::new(model)
                .with_language(language.as_deref())
                .with_diarization(diarize);
            match service.start(file_id, options).await? {
                StartOutcome::Accepted { generation } => {
                    info!("Job for file {} accepted (generation {})", file_id, generation);
                    follow(&service, file_id).await?;
                }
                StartOutcome::AlreadyRunning => bail!("File {} is already being transcribed", file_id),
                StartOutcome::NotFound => bail!("No audio file with id {}", file_id),
            }
        }

        Commands::Status { file_id, json } => {
            let status = service.status(file_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Status:       {}", status.status.as_str());
                println!("Stage:        {} ({:.1}%)", status.stage, status.progress * 100.0);
                println!("Segments:     {}", status.segment_count);
                if status.speaker_count > 0 {
                    println!("Speakers:     {}", status.speaker_count);
                }
                if let Some(model) = &status.model_used {
                    println!("Model:        {}", model);
                }
                println!("Language:     {}", status.language.as_deref().unwrap_or("auto"));
                println!(
                    "Interrupted:  {} times, {} recovery attempts",
                    status.interruption_count, status.recovery_attempts
                );
                println!("Resumable:    {}", status.can_resume);
                if status.is_stuck {
                    println!("Stuck:        no progress within the stall timeout");
                }
                if let Some(error) = &status.error_message {
                    println!("Error:        {}", error);
                }
            }
        }

        Commands::Segments {
            file_id,
            format,
            output,
        } => {
            let segments = service.segments(file_id).await?;
            let rendered = render(&segments, format);
            match output {
                Some(mut path) => {
                    if path.extension().is_none() {
                        path.set_extension(format.extension());
                    }
                    std::fs::write(&path, rendered).with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Wrote {} segments to {:?}", segments.len(), path);
                }
                None => print!("{}", rendered),
            }
        }

        Commands::Speakers { file_id } => {
            let speakers = service.speakers(file_id).await?;
            if speakers.is_empty() {
                println!("No speakers attributed to file {}", file_id);
            }
            for speaker in speakers {
                println!("{}\t{}\t{}", speaker.label, speaker.display_name, speaker.color);
            }
        }

        Commands::Clear { file_id } => {
            let summary = service.clear(file_id).await?;
            println!(
                "Cleared file {}: {} segments, {} speakers deleted",
                file_id, summary.deleted_segments, summary.deleted_speakers
            );
        }

        Commands::Cancel { file_id } => {
            if service.cancel(file_id).await? {
                println!("Cancellation requested for file {}", file_id);
            } else {
                println!("File {} is not running", file_id);
            }
        }

        Commands::Worker { interval } => {
            let recovery = service.recovery();
            let report = recovery.recover_on_startup().await?;
            info!(
                "Startup recovery: {} examined, {} resumed, {} restarted, {} abandoned",
                report.examined, report.resumed, report.restarted, report.abandoned
            );

            tokio::select! {
                _ = recovery.run_watchdog(Duration::from_secs(interval.max(1))) => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    info!("Shutting down; running jobs will be recovered on next start");
                }
            }
        }
    }

    Ok(())
}

/// Poll the record until the job reaches a terminal state, drawing a bar.
async fn follow(service: &TranscriptionService, file_id: i64) -> anyhow::Result<()> {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let status = loop {
        let status = service.status(file_id).await?;
        pb.set_position((status.progress * 1000.0).round() as u64);
        pb.set_message(status.stage.clone());
        if status.status.is_terminal() {
            break status;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    service.wait(file_id).await;

    match status.status {
        TranscriptionStatus::Completed => {
            pb.finish_with_message("completed");
            println!(
                "Transcribed file {}: {} segments with {}",
                file_id,
                status.segment_count,
                status.model_used.as_deref().unwrap_or("unknown model")
            );
            Ok(())
        }
        _ => {
            pb.abandon_with_message("failed");
            let error = status.error_message.unwrap_or_else(|| "unknown error".to_string());
            warn!("Transcription of file {} failed: {}", file_id, error);
            bail!("Transcription failed: {}", error)
        }
    }
}
