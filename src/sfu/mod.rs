pub mod buffer_pool;
pub mod relay_track;

pub use buffer_pool::{BufferPool, RTP_BUFFER_SIZE};
pub use relay_track::RelayTrack;

use std::collections::HashMap;
use std::sync::Arc;

use enclose::enc;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::models::Role;

/// Write-only destination for copies of RTP packets, scoped to one room.
/// Implementations must not block; they own the packet copy.
pub trait RecordingSink: Send + Sync {
    fn write_rtp(&self, kind: RTPCodecType, packet: Vec<u8>);
}

/// Track metadata the recording tap needs to build the muxer's SDP.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub kind: RTPCodecType,
    pub mime_type: String,
    pub clock_rate: u32,
}

/// Point-to-point reply channel back to the client that initiated an
/// operation. Used for answers, offers, trickle ICE and errors.
pub type SendToClient = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Per-room WebRTC state machines multiplexed behind a concurrent map: one
/// publisher (the speaker) relayed to any number of subscribers, with an
/// optional recording sink on the RTP path.
pub struct Sfu {
    rooms: RwLock<HashMap<Uuid, Arc<SfuRoom>>>,
    config: RTCConfiguration,
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for Sfu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sfu").finish()
    }
}

pub struct SfuRoom {
    webinar_id: Uuid,
    state: RwLock<RoomState>,
}

#[derive(Default)]
struct RoomState {
    publisher: Option<Arc<RTCPeerConnection>>,
    publisher_client: Option<String>,
    tracks: Vec<Arc<RelayTrack>>,
    subscribers: HashMap<String, Arc<RTCPeerConnection>>,
    sink: Option<Arc<dyn RecordingSink>>,
}

impl RoomState {
    fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty() && self.sink.is_none()
    }
}

impl SfuRoom {
    pub(crate) async fn current_sink(&self) -> Option<Arc<dyn RecordingSink>> {
        self.state.read().await.sink.clone()
    }

    /// Attach a local forwarder for this relay track to every current
    /// subscriber peer connection.
    async fn attach_to_subscribers(&self, relay: &Arc<RelayTrack>) {
        let subscribers: Vec<Arc<RTCPeerConnection>> = {
            let state = self.state.read().await;
            state.subscribers.values().cloned().collect()
        };
        for pc in subscribers {
            if let Err(err) = attach_local_forwarder(&pc, relay).await {
                tracing::warn!(
                    "failed to attach forwarder for track {}: {}",
                    relay.track_id(),
                    err
                );
            }
        }
    }
}

impl Sfu {
    pub fn new(ice_urls: &[String], pool: Arc<BufferPool>) -> Self {
        let ice_servers = vec![RTCIceServer {
            urls: ice_urls.to_vec(),
            ..Default::default()
        }];
        Self {
            rooms: RwLock::new(HashMap::new()),
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            pool,
        }
    }

    async fn get_or_create_room(&self, webinar_id: Uuid) -> Arc<SfuRoom> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(webinar_id)
            .or_insert_with(|| {
                tracing::debug!("sfu room {} created", webinar_id);
                Arc::new(SfuRoom {
                    webinar_id,
                    state: RwLock::new(RoomState::default()),
                })
            })
            .clone()
    }

    async fn get_room(&self, webinar_id: Uuid) -> Option<Arc<SfuRoom>> {
        self.rooms.read().await.get(&webinar_id).cloned()
    }

    /// Drop the room from the registry once nothing references it: no
    /// publisher, no subscribers, no sink.
    async fn remove_room_if_empty(&self, webinar_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&webinar_id) {
            if room.state.read().await.is_empty() {
                rooms.remove(&webinar_id);
                tracing::debug!("sfu room {} removed", webinar_id);
            }
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = api.new_peer_connection(self.config.clone()).await?;
        Ok(Arc::new(pc))
    }

    /// Accept an SDP offer from the speaker, extract remote tracks, and
    /// answer. A second offer replaces the previous publisher; its peer
    /// connection is closed and its relay tracks are invalidated.
    pub async fn handle_publisher_offer(
        &self,
        webinar_id: Uuid,
        client_id: &str,
        role: Role,
        sdp: String,
        send_to_client: SendToClient,
    ) -> Result<()> {
        if !role.can_publish() {
            return Ok(());
        }
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::Negotiation(format!("invalid offer: {e}")))?;
        let room = self.get_or_create_room(webinar_id).await;

        let previous = {
            let mut state = room.state.write().await;
            state.tracks.clear();
            state.publisher_client = None;
            state.publisher.take()
        };
        if let Some(prev) = previous {
            let _ = prev.close().await;
        }

        let pc = self.new_peer_connection().await?;
        install_ice_callback(&pc, "publisher", send_to_client.clone());

        let pool = self.pool.clone();
        pc.on_track(Box::new(enc!((room, pool) move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(enc!((room, pool) async move {
                tracing::info!(
                    "track published: webinar={} id={} kind={} ssrc={}",
                    room.webinar_id,
                    track.id(),
                    track.kind(),
                    track.ssrc()
                );
                let relay = Arc::new(RelayTrack::new(room.webinar_id, track));
                {
                    let mut state = room.state.write().await;
                    state.tracks.push(relay.clone());
                }
                room.attach_to_subscribers(&relay).await;
                tokio::spawn(enc!((relay, room, pool) async move {
                    relay.read_and_forward(room, pool).await;
                }));
            }))
        })));

        let answer = match negotiate_answer(&pc, offer).await {
            Ok(answer) => answer,
            Err(err) => {
                let _ = pc.close().await;
                self.remove_room_if_empty(webinar_id).await;
                return Err(err);
            }
        };

        {
            let mut state = room.state.write().await;
            // A racing offer may have installed a publisher meanwhile; the
            // latest one wins and the loser is closed.
            if let Some(prev) = state.publisher.replace(pc) {
                tokio::spawn(async move {
                    let _ = prev.close().await;
                });
            }
            state.publisher_client = Some(client_id.to_owned());
        }

        send_to_client(
            "webrtc_publisher_answer",
            json!({"type": answer.sdp_type.to_string(), "sdp": answer.sdp}),
        );
        Ok(())
    }

    /// Trickle ICE from the speaker.
    pub async fn handle_publisher_ice(
        &self,
        webinar_id: Uuid,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let Some(room) = self.get_room(webinar_id).await else {
            return Ok(());
        };
        let publisher = room.state.read().await.publisher.clone();
        if let Some(pc) = publisher {
            pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Create a subscriber session carrying one local forwarding track per
    /// known relay track and send the offer to the client. Without a live
    /// publisher the client gets `webrtc_error {"message": "no_stream"}`.
    pub async fn handle_subscribe(
        &self,
        webinar_id: Uuid,
        client_id: &str,
        send_to_client: SendToClient,
    ) -> Result<()> {
        let Some(room) = self.get_room(webinar_id).await else {
            send_to_client("webrtc_error", json!({"message": "no_stream"}));
            return Ok(());
        };
        let tracks: Vec<Arc<RelayTrack>> = {
            let state = room.state.read().await;
            if state.publisher.is_none() || state.tracks.is_empty() {
                drop(state);
                send_to_client("webrtc_error", json!({"message": "no_stream"}));
                return Ok(());
            }
            state.tracks.clone()
        };

        let pc = self.new_peer_connection().await?;
        install_ice_callback(&pc, "subscriber", send_to_client.clone());

        for relay in &tracks {
            if let Err(err) = attach_local_forwarder(&pc, relay).await {
                tracing::warn!(
                    "failed to attach forwarder for track {}: {}",
                    relay.track_id(),
                    err
                );
            }
        }

        let offer = match negotiate_offer(&pc).await {
            Ok(offer) => offer,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err);
            }
        };

        {
            let mut state = room.state.write().await;
            state.subscribers.insert(client_id.to_owned(), pc);
        }

        send_to_client(
            "webrtc_subscriber_offer",
            json!({"type": offer.sdp_type.to_string(), "sdp": offer.sdp}),
        );
        Ok(())
    }

    /// Apply the subscriber's SDP answer.
    pub async fn handle_subscriber_answer(
        &self,
        webinar_id: Uuid,
        client_id: &str,
        sdp: String,
    ) -> Result<()> {
        let Some(room) = self.get_room(webinar_id).await else {
            return Ok(());
        };
        let subscriber = room.state.read().await.subscribers.get(client_id).cloned();
        if let Some(pc) = subscriber {
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| Error::Negotiation(format!("invalid answer: {e}")))?;
            pc.set_remote_description(answer).await?;
        }
        Ok(())
    }

    /// Trickle ICE from a subscriber.
    pub async fn handle_subscriber_ice(
        &self,
        webinar_id: Uuid,
        client_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let Some(room) = self.get_room(webinar_id).await else {
            return Ok(());
        };
        let subscriber = room.state.read().await.subscribers.get(client_id).cloned();
        if let Some(pc) = subscriber {
            pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Remove a client's subscriber session; when the client owned the
    /// publisher session, close that too. Relay track forwarder lists are not
    /// pruned — subsequent writes to the closed forwarders fail silently.
    pub async fn unregister_client(&self, webinar_id: Uuid, client_id: &str) {
        let Some(room) = self.get_room(webinar_id).await else {
            return;
        };
        let (subscriber, publisher, empty) = {
            let mut state = room.state.write().await;
            let subscriber = state.subscribers.remove(client_id);
            let publisher = if state.publisher_client.as_deref() == Some(client_id) {
                state.publisher_client = None;
                state.tracks.clear();
                state.publisher.take()
            } else {
                None
            };
            (subscriber, publisher, state.is_empty())
        };
        if let Some(pc) = subscriber {
            let _ = pc.close().await;
        }
        if let Some(pc) = publisher {
            let _ = pc.close().await;
        }
        if empty {
            self.remove_room_if_empty(webinar_id).await;
        }
    }

    /// Close the room's publisher session; forwarding loops exit on their
    /// next read.
    pub async fn close_publisher(&self, webinar_id: Uuid) {
        let Some(room) = self.get_room(webinar_id).await else {
            return;
        };
        let (publisher, empty) = {
            let mut state = room.state.write().await;
            state.publisher_client = None;
            state.tracks.clear();
            (state.publisher.take(), state.is_empty())
        };
        if let Some(pc) = publisher {
            let _ = pc.close().await;
        }
        if empty {
            self.remove_room_if_empty(webinar_id).await;
        }
    }

    /// Snapshot of the current publisher tracks, for the recording tap.
    pub async fn get_track_info(&self, webinar_id: Uuid) -> Vec<TrackInfo> {
        let Some(room) = self.get_room(webinar_id).await else {
            return Vec::new();
        };
        let state = room.state.read().await;
        state
            .tracks
            .iter()
            .map(|t| TrackInfo {
                kind: t.kind(),
                mime_type: t.mime_type(),
                clock_rate: t.clock_rate(),
            })
            .collect()
    }

    /// Install the room's recording sink. At most one sink per room; a new
    /// registration replaces the previous one atomically.
    pub async fn register_sink(&self, webinar_id: Uuid, sink: Arc<dyn RecordingSink>) {
        let Some(room) = self.get_room(webinar_id).await else {
            return;
        };
        room.state.write().await.sink = Some(sink);
    }

    pub async fn unregister_sink(&self, webinar_id: Uuid) {
        let Some(room) = self.get_room(webinar_id).await else {
            return;
        };
        let empty = {
            let mut state = room.state.write().await;
            state.sink = None;
            state.is_empty()
        };
        if empty {
            self.remove_room_if_empty(webinar_id).await;
        }
    }

    /// Number of subscriber sessions currently held for a room.
    pub async fn subscriber_count(&self, webinar_id: Uuid) -> usize {
        match self.get_room(webinar_id).await {
            Some(room) => room.state.read().await.subscribers.len(),
            None => 0,
        }
    }

    /// Whether the room currently has a publisher session.
    pub async fn has_publisher(&self, webinar_id: Uuid) -> bool {
        match self.get_room(webinar_id).await {
            Some(room) => room.state.read().await.publisher.is_some(),
            None => false,
        }
    }
}

async fn negotiate_answer(
    pc: &Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    pc.local_description()
        .await
        .ok_or_else(|| Error::Negotiation("missing local description".to_owned()))
}

async fn negotiate_offer(pc: &Arc<RTCPeerConnection>) -> Result<RTCSessionDescription> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    pc.local_description()
        .await
        .ok_or_else(|| Error::Negotiation("missing local description".to_owned()))
}

/// Create a local forwarding track mirroring the relay track's codec and
/// identifiers, add it to the peer connection, and register it for fan-out.
/// The RTCP drain keeps the interceptor chain running for this sender.
async fn attach_local_forwarder(
    pc: &Arc<RTCPeerConnection>,
    relay: &Arc<RelayTrack>,
) -> Result<()> {
    let local = Arc::new(TrackLocalStaticRTP::new(
        relay.capability(),
        relay.track_id(),
        relay.stream_id(),
    ));
    let sender = pc
        .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    relay.attach_local(local);

    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; RTP_BUFFER_SIZE];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
    Ok(())
}

fn install_ice_callback(pc: &Arc<RTCPeerConnection>, target: &'static str, send: SendToClient) {
    pc.on_ice_candidate(Box::new(enc!((send) move |candidate: Option<RTCIceCandidate>| {
        Box::pin(enc!((send) async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => match serde_json::to_value(init) {
                    Ok(value) => {
                        send("webrtc_ice", json!({"target": target, "candidate": value}));
                    }
                    Err(err) => tracing::warn!("failed to serialize ICE candidate: {}", err),
                },
                Err(err) => tracing::warn!("failed to convert ICE candidate: {}", err),
            }
        }))
    })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sfu() -> Sfu {
        Sfu::new(
            &["stun:stun.l.google.com:19302".to_owned()],
            Arc::new(BufferPool::new()),
        )
    }

    fn capture() -> (SendToClient, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let send: SendToClient = Arc::new(enc!((sent) move |event: &str, payload| {
            sent.lock().unwrap().push((event.to_owned(), payload));
        }));
        (send, sent)
    }

    #[tokio::test]
    async fn subscribe_without_publisher_reports_no_stream() {
        let sfu = sfu();
        let webinar_id = Uuid::new_v4();
        let (send, sent) = capture();

        sfu.handle_subscribe(webinar_id, "client-1", send)
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "webrtc_error");
        assert_eq!(sent[0].1["message"], "no_stream");
        // No room was created for a failed subscribe.
        assert_eq!(sfu.subscriber_count(webinar_id).await, 0);
    }

    #[tokio::test]
    async fn audience_role_cannot_publish() {
        let sfu = sfu();
        let webinar_id = Uuid::new_v4();
        let (send, sent) = capture();

        sfu.handle_publisher_offer(webinar_id, "client-1", Role::Audience, "v=0".into(), send)
            .await
            .unwrap();

        assert!(sent.lock().unwrap().is_empty());
        assert!(!sfu.has_publisher(webinar_id).await);
        assert!(sfu.get_track_info(webinar_id).await.is_empty());
    }

    #[tokio::test]
    async fn invalid_offer_is_a_negotiation_error() {
        let sfu = sfu();
        let webinar_id = Uuid::new_v4();
        let (send, _sent) = capture();

        let result = sfu
            .handle_publisher_offer(
                webinar_id,
                "client-1",
                Role::Speaker,
                "not an sdp".into(),
                send,
            )
            .await;
        assert!(result.is_err());
        assert!(!sfu.has_publisher(webinar_id).await);
    }

    #[tokio::test]
    async fn unregister_unknown_client_is_a_no_op() {
        let sfu = sfu();
        let webinar_id = Uuid::new_v4();
        sfu.unregister_client(webinar_id, "nobody").await;
        assert_eq!(sfu.subscriber_count(webinar_id).await, 0);
    }

    #[tokio::test]
    async fn sink_registration_requires_a_room() {
        struct NullSink;
        impl RecordingSink for NullSink {
            fn write_rtp(&self, _kind: RTPCodecType, _packet: Vec<u8>) {}
        }

        let sfu = sfu();
        let webinar_id = Uuid::new_v4();
        // No room: registration is a no-op and unregister does not panic.
        sfu.register_sink(webinar_id, Arc::new(NullSink)).await;
        sfu.unregister_sink(webinar_id).await;
        assert!(sfu.get_track_info(webinar_id).await.is_empty());
    }
}
