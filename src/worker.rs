use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::RecordingStatus;
use crate::queue::{Job, JobQueue, JobType, RecordingUploadPayload, RETRY_BACKOFF};
use crate::repository::RecordingRepository;
use crate::storage::{recording_key, ObjectStorage};

/// Background processor for recording upload jobs: download from the
/// provider URL, stream into object storage, update the recording row.
pub struct UploadProcessor {
    recordings: RecordingRepository,
    storage: Arc<ObjectStorage>,
    queue: JobQueue,
    http: reqwest::Client,
}

impl std::fmt::Debug for UploadProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadProcessor").finish()
    }
}

impl UploadProcessor {
    pub fn new(
        recordings: RecordingRepository,
        storage: Arc<ObjectStorage>,
        queue: JobQueue,
    ) -> Self {
        Self {
            recordings,
            storage,
            queue,
            http: reqwest::Client::new(),
        }
    }

    /// Worker loop: dequeue, process, retry on failure. Exits when the root
    /// token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("recording upload worker started");
        loop {
            let dequeued = tokio::select! {
                _ = cancel.cancelled() => break,
                dequeued = self.queue.dequeue() => dequeued,
            };
            match dequeued {
                Ok(Some(job)) => {
                    tracing::debug!("processing job {}", job.id);
                    if let Err(err) = self.process(&job).await {
                        tracing::error!("job {} failed: {}", job.id, err);
                        if let Err(retry_err) = self.queue.retry(job).await {
                            tracing::error!("retry enqueue failed: {}", retry_err);
                        }
                        if self.backoff(&cancel).await {
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("dequeue error: {}", err);
                    if self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("recording upload worker stopped");
    }

    /// Returns true when cancelled during the backoff sleep.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(RETRY_BACKOFF) => false,
        }
    }

    /// Execute one upload job.
    pub async fn process(&self, job: &Job) -> Result<()> {
        if job.job_type != JobType::RecordingUpload {
            return Err(Error::Queue(format!("unknown job type: {:?}", job.job_type)));
        }
        let payload: RecordingUploadPayload = serde_json::from_value(job.payload.clone())?;

        let rec = self
            .recordings
            .get_by_id(payload.recording_id)
            .await?
            .ok_or_else(|| {
                Error::Queue(format!("recording not found: {}", payload.recording_id))
            })?;
        if rec.status == RecordingStatus::Completed.as_str() {
            tracing::info!("recording {} already completed", rec.id);
            return Ok(());
        }

        let response = self
            .http
            .get(&payload.original_url)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("download: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Storage(format!("download status: {e}")))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp4")
            .to_owned();

        let key = recording_key(
            &payload.webinar_id.to_string(),
            &payload.recording_id.to_string(),
        );
        let stream = Box::pin(response.bytes_stream());
        let (url, size) = self.storage.put_stream(&key, &content_type, stream).await?;

        self.recordings
            .update_upload_result(payload.recording_id, &url, &key, size, rec.duration)
            .await?;

        tracing::info!(
            "recording upload completed: recording={} key={} size={}",
            payload.recording_id,
            key,
            size
        );
        Ok(())
    }
}
