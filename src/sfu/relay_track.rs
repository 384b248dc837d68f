use std::sync::{Arc, Mutex};

use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::MarshalSize;

use super::buffer_pool::BufferPool;
use super::SfuRoom;

/// Binds one remote track from the publisher to the fan-out list of local
/// forwarding tracks, one per subscriber. Carries only the webinar id; the
/// forwarding loop receives the room handle at spawn time so ownership stays
/// acyclic.
pub struct RelayTrack {
    webinar_id: Uuid,
    remote: Arc<TrackRemote>,
    locals: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

impl std::fmt::Debug for RelayTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTrack")
            .field("webinar_id", &self.webinar_id)
            .field("track_id", &self.remote.id())
            .finish()
    }
}

impl RelayTrack {
    pub(crate) fn new(webinar_id: Uuid, remote: Arc<TrackRemote>) -> Self {
        Self {
            webinar_id,
            remote,
            locals: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> RTPCodecType {
        self.remote.kind()
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        self.remote.codec().capability
    }

    pub fn track_id(&self) -> String {
        self.remote.id()
    }

    pub fn stream_id(&self) -> String {
        self.remote.stream_id()
    }

    pub fn mime_type(&self) -> String {
        self.remote.codec().capability.mime_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.remote.codec().capability.clock_rate
    }

    /// Add a subscriber's local forwarding track. Forwarders are not removed
    /// when a subscriber leaves; writes to closed tracks fail silently until
    /// the remote track ends.
    pub(crate) fn attach_local(&self, local: Arc<TrackLocalStaticRTP>) {
        self.locals.lock().unwrap().push(local);
    }

    /// Per-track forwarding loop. Reads one RTP packet into a pooled buffer,
    /// snapshots the forwarder list under the lock, writes outside it, then
    /// hands a fresh copy to the room's recording sink if one is registered.
    /// Exits when the remote track closes.
    pub(crate) async fn read_and_forward(self: Arc<Self>, room: Arc<SfuRoom>, pool: Arc<BufferPool>) {
        let track_id = self.remote.id();
        tracing::debug!(
            "relay track {} ({}) forwarding loop started",
            track_id,
            self.remote.kind()
        );

        loop {
            let mut buf = pool.acquire();
            let n = match self.remote.read(&mut buf).await {
                Ok((pkt, _attributes)) => pkt.marshal_size(),
                Err(_) => {
                    pool.release(buf);
                    break;
                }
            };

            // Snapshot under the lock; one slow subscriber must not block
            // siblings, so writes happen after the lock is released.
            let locals: Vec<Arc<TrackLocalStaticRTP>> = self.locals.lock().unwrap().clone();
            for local in &locals {
                let _ = local.write(&buf[..n]).await;
            }

            if let Some(sink) = room.current_sink().await {
                // The sink may outlive this buffer; it owns the copy.
                sink.write_rtp(self.remote.kind(), buf[..n].to_vec());
            }

            pool.release(buf);
        }

        tracing::debug!("relay track {} forwarding loop finished", track_id);
    }
}
