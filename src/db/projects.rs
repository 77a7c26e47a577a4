use chrono::Utc;
use sqlx::SqliteConnection;

/// Returns the id of the project called `name`, creating it if needed.
pub async fn ensure(conn: &mut SqliteConnection, name: &str) -> Result<i64, sqlx::Error> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO projects (name, created_at)
        VALUES (?, ?)
        ON CONFLICT(name) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(&format!("sqlite:{}", dir.path().join("p.db").display()))
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let first = ensure(&mut conn, "interviews").await.unwrap();
        let second = ensure(&mut conn, "interviews").await.unwrap();
        let other = ensure(&mut conn, "podcasts").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        let name: String = sqlx::query_scalar("SELECT name FROM projects WHERE id = ?")
            .bind(first)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(name, "interviews");
    }
}
