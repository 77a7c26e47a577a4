//! Queries over the `audio_files` job record.
//!
//! Every write issued by a job worker is conditioned on the worker's
//! `job_generation` and on the record still being `PROCESSING`; a worker whose
//! run was cleared, cancelled or taken over sees zero affected rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TranscriptionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TranscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStatus::Pending => "PENDING",
            TranscriptionStatus::Processing => "PROCESSING",
            TranscriptionStatus::Completed => "COMPLETED",
            TranscriptionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscriptionStatus::Completed | TranscriptionStatus::Failed
        )
    }
}

impl fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(TranscriptionStatus::Pending),
            "PROCESSING" => Ok(TranscriptionStatus::Processing),
            "COMPLETED" => Ok(TranscriptionStatus::Completed),
            "FAILED" => Ok(TranscriptionStatus::Failed),
            _ => Err(format!("Unknown transcription status: {}", s)),
        }
    }
}

/// One row of `audio_files`: the uploaded recording and its job state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AudioFile {
    pub id: i64,
    pub project_id: i64,
    pub file_path: String,
    pub original_filename: String,
    pub format: String,
    pub duration: Option<f64>,

    /// ISO 639-1 code; `None` means auto-detect
    pub language: Option<String>,
    pub model_size: Option<String>,
    pub include_diarization: bool,

    pub transcription_status: TranscriptionStatus,
    pub transcription_stage: String,
    pub transcription_progress: f64,

    pub audio_transformed: bool,
    pub audio_transformation_path: Option<String>,
    pub whisper_model_loaded: Option<String>,
    /// Number of segments durably committed for the current job
    pub last_processed_segment: i64,
    pub processing_checkpoint: Option<String>,
    pub resume_token: Option<String>,

    pub transcription_started_at: Option<DateTime<Utc>>,
    pub transcription_completed_at: Option<DateTime<Utc>>,
    pub transcription_duration_seconds: Option<f64>,
    pub model_used: Option<String>,
    pub transcription_metadata: Option<String>,

    pub error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub interruption_count: i64,
    pub recovery_attempts: i64,

    pub job_generation: i64,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAudioFile {
    pub project_id: i64,
    pub file_path: String,
    pub original_filename: String,
    pub format: String,
    pub duration: Option<f64>,
}

/// Job options persisted on the record when a run is claimed.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub language: Option<&'a str>,
    pub model_size: &'a str,
    pub include_diarization: bool,
}

pub async fn insert(conn: &mut SqliteConnection, file: &NewAudioFile) -> Result<i64, sqlx::Error> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO audio_files (project_id, file_path, original_filename, format, duration, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(file.project_id)
    .bind(&file.file_path)
    .bind(&file.original_filename)
    .bind(&file.format)
    .bind(file.duration)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(id)
}

pub async fn fetch(conn: &mut SqliteConnection, id: i64) -> Result<Option<AudioFile>, sqlx::Error> {
    sqlx::query_as::<_, AudioFile>("SELECT * FROM audio_files WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn list_by_status(
    conn: &mut SqliteConnection,
    status: TranscriptionStatus,
) -> Result<Vec<AudioFile>, sqlx::Error> {
    sqlx::query_as::<_, AudioFile>(
        "SELECT * FROM audio_files WHERE transcription_status = ? ORDER BY id",
    )
    .bind(status)
    .fetch_all(conn)
    .await
}

/// Compare-and-set into `PROCESSING`.
///
/// Succeeds only if the row still has the status and generation the caller
/// observed, so two concurrent starts can never both win. Returns the new
/// generation.
pub async fn claim(
    conn: &mut SqliteConnection,
    id: i64,
    expected_status: TranscriptionStatus,
    expected_generation: i64,
    request: ClaimRequest<'_>,
    now: DateTime<Utc>,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE audio_files
        SET transcription_status = 'PROCESSING',
            transcription_stage = 'pending',
            transcription_progress = 0.0,
            transcription_started_at = ?,
            transcription_completed_at = NULL,
            transcription_duration_seconds = NULL,
            error_message = NULL,
            language = ?,
            model_size = ?,
            include_diarization = ?,
            recovery_attempts = 0,
            last_progress_at = ?,
            job_generation = job_generation + 1
        WHERE id = ?
          AND transcription_status = ?
          AND transcription_status != 'PROCESSING'
          AND job_generation = ?
        RETURNING job_generation
        "#,
    )
    .bind(now)
    .bind(request.language)
    .bind(request.model_size)
    .bind(request.include_diarization)
    .bind(now)
    .bind(id)
    .bind(expected_status)
    .bind(expected_generation)
    .fetch_optional(conn)
    .await
}

/// Monotonic progress write. Zero rows means the run is no longer current or
/// the stored fraction is already higher.
pub async fn update_progress(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    fraction: f64,
    stage: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_progress = ?, transcription_stage = ?, last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
          AND transcription_progress <= ?
        "#,
    )
    .bind(fraction)
    .bind(stage)
    .bind(now)
    .bind(id)
    .bind(generation)
    .bind(fraction)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Stage/liveness update that leaves the fraction untouched.
pub async fn touch_stage(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    stage: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_stage = ?, last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(stage)
    .bind(now)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Sets the fraction without the monotonic guard. Only used when a resumed
/// run seeds its starting point.
pub async fn seed_progress(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    fraction: f64,
    stage: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_progress = ?, transcription_stage = ?, last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(fraction)
    .bind(stage)
    .bind(now)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Write-first guard for transactions: takes the write lock and confirms the
/// run is still current in one statement.
pub async fn fence(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_audio_transformed(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    path: &str,
    duration: f64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET audio_transformed = 1, audio_transformation_path = ?, duration = COALESCE(duration, ?)
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(path)
    .bind(duration)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn set_model_loaded(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    model: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET whisper_model_loaded = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(model)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn save_checkpoint(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    checkpoint: &str,
    resume_token: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET processing_checkpoint = ?, resume_token = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(checkpoint)
    .bind(resume_token)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Advances the segment cursor together with the checkpoint it belongs to.
/// Callers run this inside the same transaction as the segment inserts.
pub async fn advance_cursor(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    cursor: i64,
    checkpoint: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET last_processed_segment = ?, processing_checkpoint = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
          AND last_processed_segment <= ?
        "#,
    )
    .bind(cursor)
    .bind(checkpoint)
    .bind(id)
    .bind(generation)
    .bind(cursor)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Drops the checkpoint of the current run so it can start over from zero.
pub async fn reset_cursor(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET last_processed_segment = 0,
            processing_checkpoint = NULL,
            resume_token = NULL,
            whisper_model_loaded = NULL,
            transcription_progress = 0.0,
            transcription_stage = 'restarting'
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn mark_completed(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    completed_at: DateTime<Utc>,
    duration_seconds: f64,
    model_used: &str,
    metadata: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_status = 'COMPLETED',
            transcription_stage = 'completed',
            transcription_progress = 1.0,
            transcription_completed_at = ?,
            transcription_duration_seconds = ?,
            model_used = ?,
            transcription_metadata = ?,
            error_message = NULL,
            last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(completed_at)
    .bind(duration_seconds)
    .bind(model_used)
    .bind(metadata)
    .bind(completed_at)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn mark_failed(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_status = 'FAILED',
            transcription_stage = 'failed',
            error_message = ?,
            last_error_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(error)
    .bind(now)
    .bind(id)
    .bind(generation)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// External cancellation: flips a running job to `FAILED`. The worker notices
/// at its next batch boundary.
pub async fn cancel(
    conn: &mut SqliteConnection,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_status = 'FAILED',
            transcription_stage = 'cancelled',
            error_message = ?,
            last_error_at = ?
        WHERE id = ? AND transcription_status = 'PROCESSING'
        "#,
    )
    .bind(reason)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Resets every status, checkpoint and telemetry field to its initial value.
pub async fn reset_to_pending(conn: &mut SqliteConnection, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE audio_files
        SET transcription_status = 'PENDING',
            transcription_stage = 'pending',
            transcription_progress = 0.0,
            audio_transformed = 0,
            audio_transformation_path = NULL,
            whisper_model_loaded = NULL,
            last_processed_segment = 0,
            processing_checkpoint = NULL,
            resume_token = NULL,
            transcription_started_at = NULL,
            transcription_completed_at = NULL,
            transcription_duration_seconds = NULL,
            model_used = NULL,
            transcription_metadata = NULL,
            error_message = NULL,
            last_error_at = NULL,
            interruption_count = 0,
            recovery_attempts = 0,
            last_progress_at = NULL,
            job_generation = job_generation + 1
        WHERE id = ?
        "#,
    )
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Takes over an interrupted run: counts the interruption and the recovery
/// attempt, and moves to a new generation so any surviving worker of the old
/// run is fenced out. Returns the new generation and attempt count.
pub async fn take_over(
    conn: &mut SqliteConnection,
    id: i64,
    expected_generation: i64,
    now: DateTime<Utc>,
) -> Result<Option<(i64, i64)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        UPDATE audio_files
        SET interruption_count = interruption_count + 1,
            recovery_attempts = recovery_attempts + 1,
            job_generation = job_generation + 1,
            last_progress_at = ?
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        RETURNING job_generation, recovery_attempts
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(expected_generation)
    .fetch_optional(conn)
    .await
}

/// Returns the new attempt count, or `None` if the run is no longer current.
pub async fn bump_recovery_attempts(
    conn: &mut SqliteConnection,
    id: i64,
    generation: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE audio_files
        SET recovery_attempts = recovery_attempts + 1
        WHERE id = ? AND job_generation = ? AND transcription_status = 'PROCESSING'
        RETURNING recovery_attempts
        "#,
    )
    .bind(id)
    .bind(generation)
    .fetch_optional(conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, projects};

    async fn setup() -> (tempfile::TempDir, crate::db::DbPool, i64) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("t.db").display());
        let pool = init_db(&url).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let project_id = projects::ensure(&mut conn, "p").await.unwrap();
        let id = insert(
            &mut conn,
            &NewAudioFile {
                project_id,
                file_path: "/tmp/a.wav".to_string(),
                original_filename: "a.wav".to_string(),
                format: "wav".to_string(),
                duration: None,
            },
        )
        .await
        .unwrap();
        (dir, pool, id)
    }

    fn request() -> ClaimRequest<'static> {
        ClaimRequest {
            language: None,
            model_size: "small",
            include_diarization: false,
        }
    }

    #[test]
    fn test_status_parsing_is_case_insensitive() {
        assert_eq!(
            "processing".parse::<TranscriptionStatus>().unwrap(),
            TranscriptionStatus::Processing
        );
        assert_eq!(
            "Completed".parse::<TranscriptionStatus>().unwrap(),
            TranscriptionStatus::Completed
        );
        assert!("done".parse::<TranscriptionStatus>().is_err());
    }

    #[tokio::test]
    async fn test_new_record_defaults() {
        let (_dir, pool, id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let file = fetch(&mut conn, id).await.unwrap().unwrap();

        assert_eq!(file.transcription_status, TranscriptionStatus::Pending);
        assert_eq!(file.transcription_progress, 0.0);
        assert_eq!(file.transcription_stage, "pending");
        assert!(!file.audio_transformed);
        assert_eq!(file.last_processed_segment, 0);
        assert!(file.language.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let (_dir, pool, id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();

        let generation = claim(&mut conn, id, TranscriptionStatus::Pending, 0, request(), now)
            .await
            .unwrap();
        assert_eq!(generation, Some(1));

        // Same observation again loses: status and generation both moved on.
        let again = claim(&mut conn, id, TranscriptionStatus::Pending, 0, request(), now)
            .await
            .unwrap();
        assert_eq!(again, None);

        let file = fetch(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(file.transcription_status, TranscriptionStatus::Processing);
    }

    #[tokio::test]
    async fn test_progress_write_is_monotonic_and_fenced() {
        let (_dir, pool, id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        let generation = claim(&mut conn, id, TranscriptionStatus::Pending, 0, request(), now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(update_progress(&mut conn, id, generation, 0.4, "transcribing", now).await.unwrap(), 1);
        assert_eq!(update_progress(&mut conn, id, generation, 0.3, "transcribing", now).await.unwrap(), 0);
        assert_eq!(update_progress(&mut conn, id, generation + 1, 0.5, "transcribing", now).await.unwrap(), 0);

        let file = fetch(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(file.transcription_progress, 0.4);
    }

    #[tokio::test]
    async fn test_legacy_lowercase_status_is_normalized_by_migration() {
        let (_dir, pool, id) = setup().await;
        sqlx::query("UPDATE audio_files SET transcription_status = 'completed' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query(include_str!("../../migrations/0002_normalize_status.sql"))
            .execute(&pool)
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let file = fetch(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(file.transcription_status, TranscriptionStatus::Completed);
    }
}
