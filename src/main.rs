use anyhow::Context as _;
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use transcribe_jobs::config::Settings;
use transcribe_jobs::db;
use transcribe_jobs::job::TranscriptionService;
use transcribe_jobs::transcribe::SpeechEngine;

mod cli;

#[cfg(feature = "whisper")]
fn build_engine(settings: &Settings) -> Arc<dyn SpeechEngine> {
    Arc::new(transcribe_jobs::transcribe::WhisperEngine::new(settings.models_dir.clone()))
}

#[cfg(not(feature = "whisper"))]
fn build_engine(_settings: &Settings) -> Arc<dyn SpeechEngine> {
    Arc::new(unavailable::UnavailableEngine)
}

#[cfg(not(feature = "whisper"))]
mod unavailable {
    use transcribe_jobs::transcribe::{
        EngineError, EngineOutput, EngineRequest, ProgressTracker, SpeechEngine, WhisperModel,
    };

    const REASON: &str = "rebuild with the `whisper` feature";

    pub struct UnavailableEngine;

    impl SpeechEngine for UnavailableEngine {
        fn load_model(&self, _model: WhisperModel, _progress: &ProgressTracker) -> Result<String, EngineError> {
            Err(EngineError::Unavailable(REASON.to_string()))
        }

        fn transcribe(
            &self,
            _samples: &[f32],
            _request: &EngineRequest,
            _progress: &ProgressTracker,
        ) -> Result<EngineOutput, EngineError> {
            Err(EngineError::Unavailable(REASON.to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();

    let settings = Settings::from_env().context("Invalid configuration")?;
    let db_pool = db::init_db(&settings.database_url)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");

    std::fs::create_dir_all(&settings.audio_cache_dir).context("Failed to create audio cache directory")?;
    std::fs::create_dir_all(&settings.models_dir).context("Failed to create models directory")?;

    let engine = build_engine(&settings);
    let service = TranscriptionService::new(&settings, db_pool, engine, None);

    cli::run(cli.command, service).await
}
