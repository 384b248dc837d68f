use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// Persistence for `user_session_logs`: one row per join, closed on leave.
#[derive(Debug, Clone)]
pub struct SessionLogRepository {
    pool: PgPool,
}

impl SessionLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_join(&self, webinar_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_session_logs (webinar_id, user_id, joined_at) VALUES ($1, $2, NOW())",
        )
        .bind(webinar_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close the most recent open row for `(webinar_id, user_id)`, filling
    /// `left_at` and the derived `watch_seconds`.
    pub async fn log_leave(&self, webinar_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE user_session_logs u \
             SET left_at = NOW(), \
                 watch_seconds = GREATEST(0, EXTRACT(EPOCH FROM (NOW() - u.joined_at))::BIGINT) \
             FROM (SELECT id FROM user_session_logs \
                   WHERE webinar_id = $1 AND user_id = $2 AND left_at IS NULL \
                   ORDER BY joined_at DESC LIMIT 1) AS open_row \
             WHERE u.id = open_row.id",
        )
        .bind(webinar_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    #[ignore = "requires database"]
    async fn leave_closes_most_recent_open_row() {}
}
