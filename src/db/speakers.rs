use serde::Serialize;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Speaker {
    pub id: i64,
    pub project_id: i64,
    pub audio_file_id: i64,
    /// Stable diarizer label, e.g. "SPEAKER_00"
    pub label: String,
    pub display_name: String,
    pub color: String,
}

/// Returns the id of the speaker with `label` for this file, creating it on
/// first use. Display name and color of an existing speaker are left alone.
pub async fn ensure(
    conn: &mut SqliteConnection,
    project_id: i64,
    audio_file_id: i64,
    label: &str,
    display_name: &str,
    color: &str,
) -> Result<i64, sqlx::Error> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO speakers (project_id, audio_file_id, label, display_name, color)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(audio_file_id, label) DO UPDATE SET label = excluded.label
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(audio_file_id)
    .bind(label)
    .bind(display_name)
    .bind(color)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

pub async fn list_for_file(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<Vec<Speaker>, sqlx::Error> {
    sqlx::query_as::<_, Speaker>("SELECT * FROM speakers WHERE audio_file_id = ? ORDER BY label")
        .bind(audio_file_id)
        .fetch_all(conn)
        .await
}

pub async fn count_for_file(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM speakers WHERE audio_file_id = ?")
        .bind(audio_file_id)
        .fetch_one(conn)
        .await
}

pub async fn delete_for_file(conn: &mut SqliteConnection, audio_file_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM speakers WHERE audio_file_id = ?")
        .bind(audio_file_id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
