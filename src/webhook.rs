use actix_web::{web, HttpRequest, HttpResponse};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use crate::api::AppState;
use crate::models::{Recording, RecordingStatus};
use crate::queue::RecordingUploadPayload;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Body posted by the external recording provider.
#[derive(Debug, Deserialize)]
pub struct RecordingReadyPayload {
    #[serde(default)]
    pub provider_recording_id: String,
    #[serde(default)]
    pub webinar_id: String,
    #[serde(default)]
    pub recording_id: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub duration: i32,
    #[serde(default)]
    pub file_size: i64,
}

/// Constant-time check of the webhook signature over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Compute the hex signature for a body; used by tests and by providers
/// integrating against this endpoint.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({"error": message}))
}

/// `POST /webhooks/recording-ready`: resolve or create the recording row,
/// record the provider URL, and enqueue the upload job. The signature is
/// checked before any database work when a secret is configured.
pub async fn recording_ready(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    if let Some(secret) = &state.webhook_secret {
        let signature = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            return HttpResponse::Unauthorized().json(json!({"error": "invalid signature"}));
        }
    }

    let payload: RecordingReadyPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return bad_request(&format!("invalid request: {err}")),
    };
    if payload.file_url.is_empty() {
        return bad_request("file_url required");
    }

    let recording_id = if payload.recording_id.is_empty() {
        None
    } else {
        match Uuid::parse_str(&payload.recording_id) {
            Ok(id) => Some(id),
            Err(_) => return bad_request("invalid recording_id"),
        }
    };
    let webinar_id = if payload.webinar_id.is_empty() {
        None
    } else {
        match Uuid::parse_str(&payload.webinar_id) {
            Ok(id) => Some(id),
            Err(_) => return bad_request("invalid webinar_id"),
        }
    };

    // Resolve by provider id first, then by our recording id, else create a
    // fresh row for this webhook.
    let mut rec: Option<Recording> = None;
    if !payload.provider_recording_id.is_empty() {
        rec = state
            .recordings
            .get_by_provider_id(&payload.provider_recording_id)
            .await
            .unwrap_or(None);
    }
    if rec.is_none() {
        if let Some(id) = recording_id {
            rec = state.recordings.get_by_id(id).await.unwrap_or(None);
        }
    }
    if rec.is_none() {
        if let Some(webinar_id) = webinar_id {
            let provider_id = (!payload.provider_recording_id.is_empty())
                .then_some(payload.provider_recording_id.as_str());
            match state
                .recordings
                .create(
                    webinar_id,
                    provider_id,
                    Some(&payload.file_url),
                    payload.duration,
                    payload.file_size,
                    RecordingStatus::Processing,
                )
                .await
            {
                Ok(created) => rec = Some(created),
                Err(err) => {
                    tracing::error!("create recording failed: {}", err);
                    return HttpResponse::InternalServerError()
                        .json(json!({"error": "failed to create recording"}));
                }
            }
        }
    }
    let Some(rec) = rec else {
        return bad_request(
            "could not identify recording (provide recording_id or provider_recording_id + webinar_id)",
        );
    };

    if rec.original_url.as_deref() != Some(payload.file_url.as_str()) {
        if let Err(err) = state
            .recordings
            .update_original_url(rec.id, &payload.file_url)
            .await
        {
            tracing::error!("update original_url failed: {}", err);
            return HttpResponse::InternalServerError()
                .json(json!({"error": "failed to update recording"}));
        }
    }

    if let Err(err) = state
        .queue
        .enqueue_recording_upload(RecordingUploadPayload {
            recording_id: rec.id,
            webinar_id: rec.webinar_id,
            original_url: payload.file_url.clone(),
        })
        .await
    {
        tracing::error!("enqueue recording upload failed: {}", err);
        return HttpResponse::InternalServerError()
            .json(json!({"error": "failed to enqueue upload"}));
    }

    tracing::info!(
        "recording_ready webhook processed: recording={} url={}",
        rec.id,
        payload.file_url
    );
    HttpResponse::Ok().json(json!({
        "success": true,
        "recording_id": rec.id,
        "status": "processing"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"provider_recording_id": "p1"}"#;
        let signature = sign_body("shared-secret", body);
        assert!(verify_signature("shared-secret", body, &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let signature = sign_body("secret-a", body);
        assert!(!verify_signature("secret-b", body, &signature));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign_body("shared-secret", b"payload");
        assert!(!verify_signature("shared-secret", b"payload2", &signature));
    }

    #[test]
    fn garbage_signature_fails() {
        assert!(!verify_signature("shared-secret", b"payload", "not-hex"));
        assert!(!verify_signature("shared-secret", b"payload", ""));
    }

    #[test]
    fn payload_defaults_for_missing_fields() {
        let payload: RecordingReadyPayload =
            serde_json::from_str(r#"{"file_url": "https://cdn/x.mp4"}"#).unwrap();
        assert_eq!(payload.file_url, "https://cdn/x.mp4");
        assert!(payload.provider_recording_id.is_empty());
        assert_eq!(payload.duration, 0);
        assert_eq!(payload.file_size, 0);
    }
}
