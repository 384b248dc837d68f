//! # livecast
//! Realtime core of a live-webinar backend: a WebRTC SFU relaying one
//! speaker's media to many audience peers, a WebSocket signaling hub fanned
//! out across instances over redis pub/sub, and a recording tap that mirrors
//! the speaker's RTP into an ffmpeg muxer and uploads the artifact to object
//! storage.

/// Operator HTTP surface and shared application state.
pub mod api;
/// Bearer-token validation and signing.
pub mod auth;
/// Environment-driven configuration.
pub mod config;
pub mod error;
/// Room membership and event fan-out, local and cross-instance.
pub mod hub;
/// Rows and enums shared with the persistence layer.
pub mod models;
/// Redis pub/sub bridge replicating webinar events across instances.
pub mod pubsub;
/// Redis-list job queue with bounded retries and a dead-letter list.
pub mod queue;
/// Recording tap: loopback RTP into an ffmpeg child process.
pub mod recorder;
pub mod repository;
/// Per-room WebRTC state machines and the RTP forwarding path.
pub mod sfu;
/// WebSocket endpoint: upgrade, heartbeat, dispatch.
pub mod socket;
/// S3-backed object storage for recording artifacts.
pub mod storage;
/// Webhook receiver for provider-produced recordings.
pub mod webhook;
/// Background upload worker.
pub mod worker;
