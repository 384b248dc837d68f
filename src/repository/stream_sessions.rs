use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::StreamSession;

const COLUMNS: &str = "id, webinar_id, started_at, ended_at, peak_viewers, total_viewers, \
                       total_watch_time, poll_participation_count, questions_count";

/// Persistence for `stream_sessions`. At most one active session (no
/// `ended_at`) per webinar.
#[derive(Debug, Clone)]
pub struct StreamSessionRepository {
    pool: PgPool,
}

impl StreamSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_active(&self, webinar_id: Uuid) -> Result<Option<StreamSession>> {
        let session = sqlx::query_as::<_, StreamSession>(&format!(
            "SELECT {COLUMNS} FROM stream_sessions \
             WHERE webinar_id = $1 AND ended_at IS NULL \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(webinar_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn get_or_create_active(&self, webinar_id: Uuid) -> Result<StreamSession> {
        if let Some(session) = self.get_active(webinar_id).await? {
            return Ok(session);
        }
        let session = sqlx::query_as::<_, StreamSession>(&format!(
            "INSERT INTO stream_sessions (webinar_id, started_at) VALUES ($1, NOW()) \
             RETURNING {COLUMNS}"
        ))
        .bind(webinar_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    /// Raise `peak_viewers`; the `WHERE $1 > peak_viewers` guard keeps the
    /// column monotonic under concurrent audience callbacks.
    pub async fn update_peak_viewers(&self, session_id: Uuid, peak: i32) -> Result<()> {
        sqlx::query(
            "UPDATE stream_sessions SET peak_viewers = $1, updated_at = NOW() \
             WHERE id = $2 AND $1 > peak_viewers",
        )
        .bind(peak)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_watch_time(&self, session_id: Uuid, delta_seconds: i64) -> Result<()> {
        sqlx::query(
            "UPDATE stream_sessions SET total_watch_time = total_watch_time + $1, \
             updated_at = NOW() WHERE id = $2",
        )
        .bind(delta_seconds)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn end(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE stream_sessions SET ended_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    #[ignore = "requires database"]
    async fn peak_viewers_never_decreases() {}
}
