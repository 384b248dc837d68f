use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use uuid::Uuid;

use crate::auth::TokenValidator;
use crate::hub::Hub;
use crate::models::{RecordingStatus, Role};
use crate::queue::JobQueue;
use crate::recorder::RecorderService;
use crate::repository::RecordingRepository;
use crate::sfu::Sfu;
use crate::storage::{recording_key, ObjectStorage};

/// Shared state handed to every route.
pub struct AppState {
    pub validator: Arc<TokenValidator>,
    pub hub: Arc<Hub>,
    pub sfu: Arc<Sfu>,
    pub recorder: Arc<RecorderService>,
    pub recordings: RecordingRepository,
    pub queue: JobQueue,
    pub storage: Option<Arc<ObjectStorage>>,
    pub webhook_secret: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ws", web::get().to(crate::socket::ws_route))
        .route(
            "/webhooks/recording-ready",
            web::post().to(crate::webhook::recording_ready),
        )
        .route(
            "/webinars/{id}/recording/start",
            web::post().to(start_recording),
        )
        .route(
            "/webinars/{id}/recording/stop",
            web::post().to(stop_recording),
        )
        .route(
            "/recordings/{id}/download-url",
            web::get().to(recording_download_url),
        );
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

/// Extract and validate the bearer token from the Authorization header.
fn bearer_identity(
    req: &HttpRequest,
    validator: &TokenValidator,
) -> Result<(Uuid, Role), HttpResponse> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if token.is_empty() {
        return Err(HttpResponse::Unauthorized().json(json!({"error": "missing bearer token"})));
    }
    validator
        .validate(token)
        .map_err(|_| HttpResponse::Unauthorized().json(json!({"error": "invalid token"})))
}

/// `POST /webinars/{id}/recording/start`: create the recording row and attach
/// the tap. Speaker or admin only.
pub async fn start_recording(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (_user_id, role) = match bearer_identity(&req, &state.validator) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if !role.can_operate() {
        return HttpResponse::Forbidden()
            .json(json!({"error": "not authorized to start recording"}));
    }
    let webinar_id = path.into_inner();

    if state.recorder.has_active(webinar_id).await {
        return HttpResponse::Conflict().json(json!({"error": "recording already in progress"}));
    }

    let rec = match state
        .recordings
        .create(webinar_id, Some("sfu"), None, 0, 0, RecordingStatus::Recording)
        .await
    {
        Ok(rec) => rec,
        Err(err) => {
            tracing::error!("create recording row failed: {}", err);
            return HttpResponse::InternalServerError()
                .json(json!({"error": "failed to start recording"}));
        }
    };

    match state.recorder.start(webinar_id, rec.id).await {
        Ok(_) => HttpResponse::Ok().json(json!({
            "recording_id": rec.id,
            "status": RecordingStatus::Recording.as_str()
        })),
        Err(err) => {
            let _ = state
                .recordings
                .update_status(rec.id, RecordingStatus::Failed)
                .await;
            tracing::error!("start recording failed: {}", err);
            HttpResponse::BadRequest().json(json!({"error": err.to_string()}))
        }
    }
}

/// `POST /webinars/{id}/recording/stop`: detach the tap, upload the artifact
/// to object storage, and complete the recording row.
pub async fn stop_recording(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (_user_id, role) = match bearer_identity(&req, &state.validator) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if !role.can_operate() {
        return HttpResponse::Forbidden()
            .json(json!({"error": "not authorized to stop recording"}));
    }
    let webinar_id = path.into_inner();

    let artifact = match state.recorder.stop(webinar_id).await {
        Ok(path) => path,
        Err(err) => return HttpResponse::NotFound().json(json!({"error": err.to_string()})),
    };

    let rec = match state
        .recordings
        .find_by_webinar_status(webinar_id, RecordingStatus::Recording)
        .await
    {
        Ok(Some(rec)) => rec,
        _ => {
            tracing::error!("no recording row in progress for webinar {}", webinar_id);
            return HttpResponse::InternalServerError()
                .json(json!({"error": "recording not found"}));
        }
    };

    let Some(storage) = &state.storage else {
        let _ = state
            .recordings
            .update_status(rec.id, RecordingStatus::Failed)
            .await;
        return HttpResponse::InternalServerError()
            .json(json!({"error": "object storage not configured"}));
    };

    let size = match tokio::fs::metadata(&artifact).await {
        Ok(meta) => meta.len() as i64,
        Err(err) => {
            let _ = state
                .recordings
                .update_status(rec.id, RecordingStatus::Failed)
                .await;
            tracing::error!("recording artifact missing: {}", err);
            return HttpResponse::InternalServerError()
                .json(json!({"error": "failed to upload recording"}));
        }
    };

    let key = recording_key(&webinar_id.to_string(), &rec.id.to_string());
    match storage.put_file(&key, "video/mp4", &artifact).await {
        Ok(url) => {
            if let Err(err) = state
                .recordings
                .update_upload_result(rec.id, &url, &key, size, 0)
                .await
            {
                tracing::error!("update recording result failed: {}", err);
            }
            let _ = tokio::fs::remove_file(&artifact).await;
            HttpResponse::Ok().json(json!({
                "recording_id": rec.id,
                "status": RecordingStatus::Completed.as_str(),
                "s3_url": url,
                "s3_key": key,
                "file_size": size
            }))
        }
        Err(err) => {
            let _ = state
                .recordings
                .update_status(rec.id, RecordingStatus::Failed)
                .await;
            tracing::error!("upload recording failed: {}", err);
            HttpResponse::InternalServerError()
                .json(json!({"error": "failed to upload recording"}))
        }
    }
}

/// `GET /recordings/{id}/download-url`: presigned GET for a stored artifact.
pub async fn recording_download_url(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> HttpResponse {
    if let Err(response) = bearer_identity(&req, &state.validator) {
        return response;
    }
    let recording_id = path.into_inner();

    let rec = match state.recordings.get_by_id(recording_id).await {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({"error": "recording not found"}))
        }
        Err(err) => {
            tracing::error!("load recording failed: {}", err);
            return HttpResponse::InternalServerError()
                .json(json!({"error": "failed to load recording"}));
        }
    };
    let Some(key) = rec.s3_key.filter(|k| !k.is_empty()) else {
        return HttpResponse::NotFound().json(json!({"error": "recording has no stored artifact"}));
    };
    let Some(storage) = &state.storage else {
        return HttpResponse::InternalServerError()
            .json(json!({"error": "object storage not configured"}));
    };

    match storage.presign_download(&key).await {
        Ok(url) => HttpResponse::Ok().json(json!({
            "download_url": url,
            "expires_in": storage.presign_expire().as_secs()
        })),
        Err(err) => {
            tracing::error!("presign download failed: {}", err);
            HttpResponse::InternalServerError()
                .json(json!({"error": "failed to generate download URL"}))
        }
    }
}
