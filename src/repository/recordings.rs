use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Recording, RecordingStatus};

const COLUMNS: &str = "id, webinar_id, provider_recording_id, original_url, s3_url, s3_key, \
                       duration, file_size, status, created_at, updated_at";

/// Persistence for `recordings`.
#[derive(Debug, Clone)]
pub struct RecordingRepository {
    pool: PgPool,
}

impl RecordingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        webinar_id: Uuid,
        provider_recording_id: Option<&str>,
        original_url: Option<&str>,
        duration: i32,
        file_size: i64,
        status: RecordingStatus,
    ) -> Result<Recording> {
        let rec = sqlx::query_as::<_, Recording>(&format!(
            "INSERT INTO recordings (webinar_id, provider_recording_id, original_url, duration, file_size, status) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {COLUMNS}"
        ))
        .bind(webinar_id)
        .bind(provider_recording_id)
        .bind(original_url)
        .bind(duration)
        .bind(file_size)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(rec)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Recording>> {
        let rec = sqlx::query_as::<_, Recording>(&format!(
            "SELECT {COLUMNS} FROM recordings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec)
    }

    pub async fn get_by_provider_id(&self, provider_id: &str) -> Result<Option<Recording>> {
        let rec = sqlx::query_as::<_, Recording>(&format!(
            "SELECT {COLUMNS} FROM recordings WHERE provider_recording_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec)
    }

    /// Most recent recording for a webinar in the given status, if any.
    pub async fn find_by_webinar_status(
        &self,
        webinar_id: Uuid,
        status: RecordingStatus,
    ) -> Result<Option<Recording>> {
        let rec = sqlx::query_as::<_, Recording>(&format!(
            "SELECT {COLUMNS} FROM recordings WHERE webinar_id = $1 AND status = $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(webinar_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec)
    }

    pub async fn update_status(&self, id: Uuid, status: RecordingStatus) -> Result<()> {
        sqlx::query("UPDATE recordings SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the provider's file URL and mark the row as processing.
    pub async fn update_original_url(&self, id: Uuid, original_url: &str) -> Result<()> {
        sqlx::query(
            "UPDATE recordings SET original_url = $1, status = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(original_url)
        .bind(RecordingStatus::Processing.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the stored artifact and mark the row completed.
    pub async fn update_upload_result(
        &self,
        id: Uuid,
        s3_url: &str,
        s3_key: &str,
        file_size: i64,
        duration: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE recordings SET s3_url = $1, s3_key = $2, file_size = $3, duration = $4, \
             status = $5, updated_at = NOW() WHERE id = $6",
        )
        .bind(s3_url)
        .bind(s3_key)
        .bind(file_size)
        .bind(duration)
        .bind(RecordingStatus::Completed.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    #[ignore = "requires database"]
    async fn create_and_resolve_by_provider_id() {}
}
