use serde::Serialize;
use sqlx::SqliteConnection;

/// A persisted transcript segment, joined with its speaker label if any.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SegmentRecord {
    pub id: i64,
    pub audio_file_id: i64,
    pub sequence: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub original_text: String,
    pub edited_text: Option<String>,
    pub speaker_id: Option<i64>,
    pub speaker_label: Option<String>,
    pub speaker_name: Option<String>,
}

impl SegmentRecord {
    /// Text as it should be shown: the correction if one exists.
    pub fn text(&self) -> &str {
        self.edited_text.as_deref().unwrap_or(&self.original_text)
    }
}

#[derive(Debug, Clone)]
pub struct NewSegment<'a> {
    pub audio_file_id: i64,
    pub sequence: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub original_text: &'a str,
}

pub async fn insert(conn: &mut SqliteConnection, segment: &NewSegment<'_>) -> Result<i64, sqlx::Error> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO segments (audio_file_id, sequence, start_time, end_time, original_text)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(segment.audio_file_id)
    .bind(segment.sequence)
    .bind(segment.start_time)
    .bind(segment.end_time)
    .bind(segment.original_text)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

pub async fn count_for_file(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM segments WHERE audio_file_id = ?")
        .bind(audio_file_id)
        .fetch_one(conn)
        .await
}

/// Next free sequence number for a file (0 when it has no segments).
pub async fn next_sequence(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COALESCE(MAX(sequence) + 1, 0) FROM segments WHERE audio_file_id = ?")
        .bind(audio_file_id)
        .fetch_one(conn)
        .await
}

pub async fn list_for_file(
    conn: &mut SqliteConnection,
    audio_file_id: i64,
) -> Result<Vec<SegmentRecord>, sqlx::Error> {
    sqlx::query_as::<_, SegmentRecord>(
        r#"
        SELECT s.id, s.audio_file_id, s.sequence, s.start_time, s.end_time,
               s.original_text, s.edited_text, s.speaker_id,
               sp.label AS speaker_label, sp.display_name AS speaker_name
        FROM segments s
        LEFT JOIN speakers sp ON sp.id = s.speaker_id
        WHERE s.audio_file_id = ?
        ORDER BY s.sequence
        "#,
    )
    .bind(audio_file_id)
    .fetch_all(conn)
    .await
}

/// Only the speaker reference is ever rewritten after creation.
pub async fn set_speaker(
    conn: &mut SqliteConnection,
    segment_id: i64,
    speaker_id: Option<i64>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE segments SET speaker_id = ? WHERE id = ?")
        .bind(speaker_id)
        .bind(segment_id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_for_file(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM segments WHERE audio_file_id = ?")
        .bind(audio_file_id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
