use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub mod audio_files;
pub mod projects;
pub mod segments;
pub mod speakers;

pub use audio_files::{AudioFile, NewAudioFile, TranscriptionStatus};
pub use segments::{NewSegment, SegmentRecord};
pub use speakers::Speaker;

pub type DbPool = SqlitePool;

pub async fn init_db(database_url: &str) -> Result<DbPool, sqlx::Error> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        let path = path.split('?').next().unwrap_or(path);
        if !path.is_empty() && path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Hands out a fresh connection (or transaction) per operation.
///
/// Connections are never shared between the job worker and request handlers;
/// each caller acquires its own and drops it when the operation is done.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    pool: DbPool,
}

impl SessionFactory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn session(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    pub async fn transaction(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
