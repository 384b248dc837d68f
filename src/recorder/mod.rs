pub mod sdp;
pub mod sink;

pub use sink::UdpSink;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sfu::Sfu;

const MUXER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Taps a room's RTP path into an ffmpeg child process that muxes the stream
/// into a single mp4 file. At most one active session per room.
pub struct RecorderService {
    sfu: Arc<Sfu>,
    output_dir: PathBuf,
    max_duration_secs: u64,
    sessions: Mutex<HashMap<Uuid, RecordingSession>>,
}

impl std::fmt::Debug for RecorderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderService")
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

struct RecordingSession {
    recording_id: Uuid,
    output_path: PathBuf,
    sdp_path: PathBuf,
    child: Child,
}

impl RecorderService {
    pub fn new(sfu: Arc<Sfu>, output_dir: PathBuf, max_duration_secs: u64) -> Self {
        Self {
            sfu,
            output_dir,
            max_duration_secs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start recording a room: allocate loopback ports, write the SDP scratch
    /// file, spawn the muxer, and register the sink with the SFU. Returns the
    /// artifact path the muxer writes to.
    pub async fn start(&self, webinar_id: Uuid, recording_id: Uuid) -> Result<PathBuf> {
        // Holding the session map for the whole setup serializes concurrent
        // starts, keeping at most one active session per room.
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&webinar_id) {
            return Err(Error::Recording("recording already in progress".to_owned()));
        }

        let tracks = self.sfu.get_track_info(webinar_id).await;
        if tracks.is_empty() {
            return Err(Error::Recording(
                "no publisher tracks: start recording after the speaker is live".to_owned(),
            ));
        }

        let video_port = ephemeral_port().await?;
        let audio_port = ephemeral_port().await?;

        let body = sdp::build_sdp(&tracks, video_port, audio_port);
        let dir = self.output_dir.join("recordings");
        tokio::fs::create_dir_all(&dir).await?;
        let output_path = dir.join(format!("{recording_id}.mp4"));
        let sdp_path = dir.join(format!("{recording_id}.sdp"));
        tokio::fs::write(&sdp_path, body.as_bytes()).await?;

        // Copy codec, cap the duration, overwrite any stale artifact. stdin
        // stays open so stop() can ask ffmpeg to finalize the file.
        let spawned = Command::new("ffmpeg")
            .args(["-protocol_whitelist", "file,udp,rtp", "-f", "sdp", "-i"])
            .arg(&sdp_path)
            .args(["-c", "copy", "-t", &self.max_duration_secs.to_string(), "-y"])
            .arg(&output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let _ = tokio::fs::remove_file(&sdp_path).await;
                return Err(Error::Recording(format!("failed to start muxer: {err}")));
            }
        };

        let video = match dial_loopback(video_port).await {
            Ok(socket) => socket,
            Err(err) => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(&sdp_path).await;
                return Err(err);
            }
        };
        let audio = match dial_loopback(audio_port).await {
            Ok(socket) => socket,
            Err(err) => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(&sdp_path).await;
                return Err(err);
            }
        };

        let sink = Arc::new(UdpSink::new(video, audio));
        self.sfu.register_sink(webinar_id, sink).await;

        sessions.insert(
            webinar_id,
            RecordingSession {
                recording_id,
                output_path: output_path.clone(),
                sdp_path,
                child,
            },
        );

        tracing::info!(
            "recording started: webinar={} recording={} output={}",
            webinar_id,
            recording_id,
            output_path.display()
        );
        Ok(output_path)
    }

    /// Stop the room's recording: deregister the sink, ask the muxer to
    /// finalize, wait bounded before killing, and delete the SDP scratch
    /// file. Returns the artifact path; the caller uploads and removes it.
    pub async fn stop(&self, webinar_id: Uuid) -> Result<PathBuf> {
        let mut session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&webinar_id).ok_or_else(|| {
                Error::Recording(format!("no active recording for webinar {webinar_id}"))
            })?
        };

        self.sfu.unregister_sink(webinar_id).await;

        if let Some(mut stdin) = session.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        if tokio::time::timeout(MUXER_STOP_TIMEOUT, session.child.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "muxer for recording {} did not exit in time, killing",
                session.recording_id
            );
            let _ = session.child.kill().await;
        }

        let _ = tokio::fs::remove_file(&session.sdp_path).await;

        tracing::info!(
            "recording stopped: webinar={} output={}",
            webinar_id,
            session.output_path.display()
        );
        Ok(session.output_path)
    }

    pub async fn has_active(&self, webinar_id: Uuid) -> bool {
        self.sessions.lock().await.contains_key(&webinar_id)
    }
}

async fn ephemeral_port() -> Result<u16> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();
    drop(socket);
    Ok(port)
}

async fn dial_loopback(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(("127.0.0.1", port)).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::BufferPool;

    fn recorder() -> RecorderService {
        let sfu = Arc::new(Sfu::new(
            &["stun:stun.l.google.com:19302".to_owned()],
            Arc::new(BufferPool::new()),
        ));
        RecorderService::new(sfu, std::env::temp_dir(), 7200)
    }

    #[tokio::test]
    async fn start_without_publisher_tracks_fails() {
        let recorder = recorder();
        let err = recorder
            .start(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Recording(_)));
        assert!(err.to_string().contains("no publisher tracks"));
    }

    #[tokio::test]
    async fn stop_without_session_fails() {
        let recorder = recorder();
        let webinar_id = Uuid::new_v4();
        assert!(!recorder.has_active(webinar_id).await);
        let err = recorder.stop(webinar_id).await.unwrap_err();
        assert!(err.to_string().contains("no active recording"));
    }

    #[tokio::test]
    async fn ephemeral_ports_are_distinct_and_nonzero() {
        let a = ephemeral_port().await.unwrap();
        let b = ephemeral_port().await.unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
