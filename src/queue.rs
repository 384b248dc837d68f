use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Redis list for recording upload jobs.
pub const QUEUE_RECORDINGS: &str = "worker:recordings";
/// Dead-letter list for jobs that exhausted their retries.
pub const QUEUE_DLQ: &str = "worker:dlq";
/// A job moves to the DLQ after this many failed attempts.
pub const MAX_ATTEMPTS: u32 = 3;
/// Fixed delay between retries.
pub const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);

const DEQUEUE_BLOCK_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    RecordingUpload,
}

/// Generic job envelope pushed on the worker lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Queue a failed job lands on for its next attempt.
    pub fn retry_queue(&self) -> &'static str {
        if self.attempt >= MAX_ATTEMPTS {
            QUEUE_DLQ
        } else {
            QUEUE_RECORDINGS
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingUploadPayload {
    pub recording_id: Uuid,
    pub webinar_id: Uuid,
    pub original_url: String,
}

/// Redis-list backed job queue shared by the webhook handler (producer) and
/// the upload worker (consumer).
#[derive(Clone)]
pub struct JobQueue {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish()
    }
}

impl JobQueue {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn enqueue_recording_upload(&self, payload: RecordingUploadPayload) -> Result<()> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: JobType::RecordingUpload,
            payload: serde_json::to_value(&payload)?,
            attempt: 0,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(QUEUE_RECORDINGS, raw).await?;
        tracing::debug!(
            "enqueued recording upload job {} for recording {}",
            job.id,
            payload.recording_id
        );
        Ok(())
    }

    /// Pop the next job, blocking up to a few seconds so the caller's
    /// shutdown check stays responsive. `None` means the wait timed out.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> =
            conn.blpop(QUEUE_RECORDINGS, DEQUEUE_BLOCK_SECS).await?;
        let Some((_key, raw)) = result else {
            return Ok(None);
        };
        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                tracing::warn!("dropping invalid job payload: {}", err);
                Ok(None)
            }
        }
    }

    /// Re-enqueue a failed job with an incremented attempt counter; after
    /// [`MAX_ATTEMPTS`] failures it goes to the dead-letter queue instead.
    pub async fn retry(&self, mut job: Job) -> Result<()> {
        job.attempt += 1;
        let destination = job.retry_queue();
        let raw = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(destination, raw).await?;
        if destination == QUEUE_DLQ {
            tracing::warn!("job {} moved to DLQ after {} attempts", job.id, job.attempt);
        } else {
            tracing::info!("job {} retried, attempt {}", job.id, job.attempt);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(attempt: u32) -> Job {
        Job {
            id: "job-1".to_owned(),
            job_type: JobType::RecordingUpload,
            payload: serde_json::json!({}),
            attempt,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn job_envelope_round_trip() {
        let payload = RecordingUploadPayload {
            recording_id: Uuid::new_v4(),
            webinar_id: Uuid::new_v4(),
            original_url: "https://cdn.example.com/x.mp4".to_owned(),
        };
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: JobType::RecordingUpload,
            payload: serde_json::to_value(&payload).unwrap(),
            attempt: 0,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&job).unwrap();
        assert!(raw.contains("\"type\":\"recording_upload\""));
        let parsed: Job = serde_json::from_str(&raw).unwrap();
        let parsed_payload: RecordingUploadPayload =
            serde_json::from_value(parsed.payload).unwrap();
        assert_eq!(parsed_payload.recording_id, payload.recording_id);
        assert_eq!(parsed_payload.original_url, payload.original_url);
    }

    #[test]
    fn retries_stay_on_the_work_queue_until_the_bound() {
        // retry() increments before routing, so attempts 1 and 2 re-enqueue
        // and the third failure dead-letters.
        assert_eq!(job(1).retry_queue(), QUEUE_RECORDINGS);
        assert_eq!(job(2).retry_queue(), QUEUE_RECORDINGS);
        assert_eq!(job(3).retry_queue(), QUEUE_DLQ);
        assert_eq!(job(4).retry_queue(), QUEUE_DLQ);
    }
}
