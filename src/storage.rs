use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Minimum part size accepted by the S3 multipart API (5 MiB).
const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// S3-backed object storage for recording artifacts.
pub struct ObjectStorage {
    client: Client,
    bucket: String,
    region: String,
    presign_expire: Duration,
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

/// `recordings/{webinar_id}/{recording_id}.mp4`
pub fn recording_key(webinar_id: &str, recording_id: &str) -> String {
    format!("recordings/{webinar_id}/{recording_id}.mp4")
}

impl ObjectStorage {
    pub async fn new(cfg: &StorageConfig) -> Result<Self> {
        if cfg.region.is_empty() || cfg.recordings_bucket.is_empty() {
            return Err(Error::Config(
                "object storage requires a region and bucket".to_owned(),
            ));
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()));
        if !cfg.access_key_id.is_empty() && !cfg.secret_access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                cfg.access_key_id.clone(),
                cfg.secret_access_key.clone(),
                None,
                None,
                "livecast",
            ));
        }
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: Client::new(&sdk_config),
            bucket: cfg.recordings_bucket.clone(),
            region: cfg.region.clone(),
            presign_expire: Duration::from_secs(cfg.presign_expire_minutes * 60),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Public object URL; meaningful when the bucket allows direct reads.
    pub fn object_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        )
    }

    /// Upload a local file (e.g. the muxer artifact).
    pub async fn put_file(
        &self,
        key: &str,
        content_type: &str,
        path: &std::path::Path,
    ) -> Result<String> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::Storage(format!("read {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("put object: {e}")))?;
        Ok(self.object_url(key))
    }

    /// Stream a byte stream to S3, buffering into multipart chunks so large
    /// recordings never sit in memory whole. Returns the object URL and the
    /// total byte count.
    pub async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        mut data: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin,
    ) -> Result<(String, i64)> {
        let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
        let mut upload_id: Option<String> = None;
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut part_number: i32 = 0;
        let mut total: i64 = 0;

        let result: Result<()> = async {
            loop {
                let mut last_part = false;
                loop {
                    match data.next().await {
                        Some(chunk) => {
                            let chunk =
                                chunk.map_err(|e| Error::Storage(format!("download: {e}")))?;
                            buf.extend_from_slice(&chunk);
                            if buf.len() >= CHUNK_SIZE {
                                break;
                            }
                        }
                        None => {
                            last_part = true;
                            break;
                        }
                    }
                }

                total += buf.len() as i64;
                part_number += 1;

                // A single chunk skips the multipart API entirely.
                if last_part && part_number == 1 {
                    self.client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .content_type(content_type)
                        .body(ByteStream::from(std::mem::take(&mut buf)))
                        .send()
                        .await
                        .map_err(|e| Error::Storage(format!("put object: {e}")))?;
                    return Ok(());
                }

                let id = match &upload_id {
                    Some(id) => id.clone(),
                    None => {
                        let created = self
                            .client
                            .create_multipart_upload()
                            .bucket(&self.bucket)
                            .key(key)
                            .content_type(content_type)
                            .send()
                            .await
                            .map_err(|e| Error::Storage(format!("create multipart: {e}")))?;
                        let id = created
                            .upload_id()
                            .ok_or_else(|| Error::Storage("missing upload id".to_owned()))?
                            .to_owned();
                        upload_id = Some(id.clone());
                        id
                    }
                };

                let uploaded = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&id)
                    .part_number(part_number)
                    .body(ByteStream::from(std::mem::take(&mut buf)))
                    .send()
                    .await
                    .map_err(|e| Error::Storage(format!("upload part {part_number}: {e}")))?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(uploaded.e_tag().map(str::to_owned))
                        .build(),
                );

                if last_part {
                    self.client
                        .complete_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&id)
                        .multipart_upload(
                            CompletedMultipartUpload::builder()
                                .set_parts(Some(std::mem::take(&mut parts)))
                                .build(),
                        )
                        .send()
                        .await
                        .map_err(|e| Error::Storage(format!("complete multipart: {e}")))?;
                    return Ok(());
                }

                buf = Vec::with_capacity(CHUNK_SIZE);
            }
        }
        .await;

        if let Err(err) = result {
            if let Some(id) = upload_id {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(id)
                    .send()
                    .await;
            }
            return Err(err);
        }

        Ok((self.object_url(key), total))
    }

    /// Presigned GET URL for downloading an artifact.
    pub async fn presign_download(&self, key: &str) -> Result<String> {
        let presigning = PresigningConfig::expires_in(self.presign_expire)
            .map_err(|e| Error::Storage(format!("presign config: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| Error::Storage(format!("presign get: {e}")))?;
        Ok(presigned.uri().to_string())
    }

    pub fn presign_expire(&self) -> Duration {
        self.presign_expire
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("delete object: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_key_layout() {
        assert_eq!(
            recording_key("w-1", "r-2"),
            "recordings/w-1/r-2.mp4"
        );
    }
}
