use std::sync::Arc;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use livecast::api::{self, AppState};
use livecast::auth::TokenValidator;
use livecast::config::Config;
use livecast::hub::Hub;
use livecast::pubsub::EventBus;
use livecast::queue::JobQueue;
use livecast::recorder::RecorderService;
use livecast::repository::{RecordingRepository, SessionLogRepository, StreamSessionRepository};
use livecast::sfu::{BufferPool, Sfu};
use livecast::storage::ObjectStorage;
use livecast::worker::UploadProcessor;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env().expect("failed to load configuration");

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&cfg.database.dsn())
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let redis_client = redis::Client::open(cfg.redis.url()).expect("invalid redis url");
    let bus = Arc::new(
        EventBus::new(redis_client.clone())
            .await
            .expect("failed to connect to redis"),
    );
    let queue_conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .expect("failed to connect to redis");
    let queue = JobQueue::new(queue_conn);

    let storage = if cfg.storage.region.is_empty() {
        tracing::warn!("AWS_REGION not set, object storage disabled");
        None
    } else {
        match ObjectStorage::new(&cfg.storage).await {
            Ok(storage) => Some(Arc::new(storage)),
            Err(err) => {
                tracing::warn!("object storage disabled: {}", err);
                None
            }
        }
    };

    let validator = Arc::new(
        TokenValidator::new(&cfg.jwt.secret, cfg.jwt.expire_hours)
            .expect("invalid JWT configuration"),
    );
    let buffer_pool = Arc::new(BufferPool::new());
    let sfu = Arc::new(Sfu::new(&cfg.webrtc.ice_urls, buffer_pool));
    let hub = Hub::new(Some(bus));
    let recorder = Arc::new(RecorderService::new(
        sfu.clone(),
        cfg.recording.output_dir.clone(),
        cfg.recording.max_duration_secs,
    ));

    let recordings = RecordingRepository::new(pool.clone());
    let stream_sessions = StreamSessionRepository::new(pool.clone());
    let session_logs = SessionLogRepository::new(pool.clone());

    // Peak-viewer tracking: the repository's guarded update keeps the column
    // monotonic under concurrent callbacks.
    {
        let stream_sessions = stream_sessions.clone();
        hub.set_audience_change_handler(Box::new(move |webinar_id, count| {
            let stream_sessions = stream_sessions.clone();
            tokio::spawn(async move {
                match stream_sessions.get_or_create_active(webinar_id).await {
                    Ok(session) => {
                        if count as i32 > session.peak_viewers {
                            if let Err(err) = stream_sessions
                                .update_peak_viewers(session.id, count as i32)
                                .await
                            {
                                tracing::warn!("failed to update peak viewers: {}", err);
                            }
                        }
                    }
                    Err(err) => tracing::warn!("failed to load stream session: {}", err),
                }
            });
        }));
    }

    // Attendee session logs from the hub's join/leave transitions.
    {
        let join_repo = session_logs.clone();
        let leave_repo = session_logs;
        hub.set_session_logger(
            Box::new(move |webinar_id, user_id| {
                let repo = join_repo.clone();
                tokio::spawn(async move {
                    if let Err(err) = repo.log_join(webinar_id, user_id).await {
                        tracing::warn!("failed to log join: {}", err);
                    }
                });
            }),
            Box::new(move |webinar_id, user_id, _joined_at| {
                let repo = leave_repo.clone();
                tokio::spawn(async move {
                    if let Err(err) = repo.log_leave(webinar_id, user_id).await {
                        tracing::warn!("failed to log leave: {}", err);
                    }
                });
            }),
        );
    }

    // Background upload worker shares the root cancellation token.
    let cancel = CancellationToken::new();
    if let Some(storage) = storage.clone() {
        let processor = UploadProcessor::new(recordings.clone(), storage, queue.clone());
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            processor.run(worker_cancel).await;
        });
    }

    let state = web::Data::new(AppState {
        validator,
        hub,
        sfu,
        recorder,
        recordings,
        queue,
        storage,
        webhook_secret: cfg.webhook.secret.clone(),
    });

    let cors_origins = cfg.server.cors_allowed_origins.clone();
    let port = cfg.server.port;
    tracing::info!("server listening on port {}", port);
    let result = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(build_cors(&cors_origins))
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(("0.0.0.0", port))?
    .shutdown_timeout(15)
    .run()
    .await;

    cancel.cancel();
    tracing::info!("server stopped");
    result
}

fn build_cors(allowed_origins: &str) -> Cors {
    if allowed_origins.trim() == "*" {
        return Cors::permissive();
    }
    let mut cors = Cors::default();
    for origin in allowed_origins.split(',').map(str::trim) {
        if !origin.is_empty() {
            cors = cors.allowed_origin(origin);
        }
    }
    cors.allowed_header(header::CONTENT_TYPE)
        .allowed_header(header::AUTHORIZATION)
        .allow_any_method()
}
