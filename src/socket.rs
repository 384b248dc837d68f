use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::api::AppState;
use crate::hub::{Client, Hub, WsMessage};
use crate::models::Role;
use crate::sfu::{SendToClient, Sfu};

/// Ping interval for the heartbeat timer.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection missing pongs for this long is dropped.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Maximum inbound frame size.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const OUTBOUND_QUEUE_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub webinar_id: String,
    pub token: String,
}

/// Closed set of client-originated events. Unknown events parse into
/// [`ClientEvent::Unknown`] and are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join,
    WebrtcPublisherOffer(SdpPayload),
    WebrtcSubscribe,
    WebrtcSubscriberAnswer(SdpPayload),
    WebrtcIce(IcePayload),
    AskQuestion(serde_json::Value),
    ApproveQuestion(serde_json::Value),
    LaunchPoll(serde_json::Value),
    AnswerPoll(serde_json::Value),
    RotateAd(serde_json::Value),
    ChatMessage(serde_json::Value),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type", default)]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
pub struct IcePayload {
    pub target: IceTarget,
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceTarget {
    Publisher,
    Subscriber,
}

/// Upgrade handler for `GET /ws?webinar_id={uuid}&token={jwt}`. The token is
/// validated before the upgrade; failures answer with plain HTTP.
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let Ok(webinar_id) = Uuid::parse_str(&query.webinar_id) else {
        return Ok(HttpResponse::BadRequest().json(json!({"error": "invalid webinar_id"})));
    };
    let (user_id, role) = match state.validator.validate(&query.token) {
        Ok(identity) => identity,
        Err(err) => {
            tracing::debug!("websocket auth failed: {}", err);
            return Ok(HttpResponse::Unauthorized().json(json!({"error": "invalid token"})));
        }
    };

    let session = WsSession::new(
        webinar_id,
        user_id,
        role,
        state.hub.clone(),
        state.sfu.clone(),
    );
    Ok(ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()?)
}

/// One WebSocket connection. The actor mailbox serves as the outbound queue;
/// the heartbeat timer doubles as the read deadline.
pub struct WsSession {
    webinar_id: Uuid,
    user_id: Uuid,
    role: Role,
    hub: Arc<Hub>,
    sfu: Arc<Sfu>,
    client: Option<Client>,
    hb: Instant,
}

impl WsSession {
    pub fn new(webinar_id: Uuid, user_id: Uuid, role: Role, hub: Arc<Hub>, sfu: Arc<Sfu>) -> Self {
        Self {
            webinar_id,
            user_id,
            role,
            hub,
            sfu,
            client: None,
            hb: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(PING_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > PONG_WAIT {
                tracing::debug!("client in webinar {} missed pong deadline", act.webinar_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Reply channel for WebRTC signaling addressed to this client only.
    fn sender(&self) -> SendToClient {
        let hub = self.hub.clone();
        let webinar_id = self.webinar_id;
        let client_id = self
            .client
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default();
        Arc::new(move |event: &str, payload: serde_json::Value| {
            hub.send_to_client(webinar_id, &client_id, event, payload);
        })
    }

    fn relay_broadcast(&self, event: &'static str, payload: serde_json::Value) {
        let hub = self.hub.clone();
        let webinar_id = self.webinar_id;
        actix::spawn(async move {
            hub.broadcast_and_publish(webinar_id, event, payload).await;
        });
    }

    fn dispatch(&mut self, event: ClientEvent) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let sfu = self.sfu.clone();
        let hub = self.hub.clone();
        let send = self.sender();
        let webinar_id = self.webinar_id;
        let client_id = client.id.clone();
        let role = self.role;

        match event {
            ClientEvent::Join => {
                let user_id = self.user_id;
                actix::spawn(async move {
                    let count = hub.audience_count(webinar_id);
                    hub.broadcast_and_publish(
                        webinar_id,
                        "audience_count",
                        json!({"count": count}),
                    )
                    .await;
                    hub.broadcast_and_publish(
                        webinar_id,
                        "join",
                        json!({"user_id": user_id, "role": role}),
                    )
                    .await;
                });
            }
            ClientEvent::WebrtcPublisherOffer(payload) => {
                if payload.sdp.is_empty() {
                    return;
                }
                actix::spawn(async move {
                    if let Err(err) = sfu
                        .handle_publisher_offer(webinar_id, &client_id, role, payload.sdp, send.clone())
                        .await
                    {
                        tracing::warn!("publisher offer failed: {}", err);
                        send("webrtc_error", json!({"message": err.to_string()}));
                    }
                });
            }
            ClientEvent::WebrtcSubscribe => {
                actix::spawn(async move {
                    if let Err(err) = sfu
                        .handle_subscribe(webinar_id, &client_id, send.clone())
                        .await
                    {
                        tracing::warn!("subscribe failed: {}", err);
                        send("webrtc_error", json!({"message": err.to_string()}));
                    }
                });
            }
            ClientEvent::WebrtcSubscriberAnswer(payload) => {
                if payload.sdp.is_empty() {
                    return;
                }
                actix::spawn(async move {
                    if let Err(err) = sfu
                        .handle_subscriber_answer(webinar_id, &client_id, payload.sdp)
                        .await
                    {
                        tracing::warn!("subscriber answer failed: {}", err);
                        send("webrtc_error", json!({"message": err.to_string()}));
                    }
                });
            }
            ClientEvent::WebrtcIce(payload) => {
                actix::spawn(async move {
                    let result = match payload.target {
                        IceTarget::Publisher => {
                            sfu.handle_publisher_ice(webinar_id, payload.candidate).await
                        }
                        IceTarget::Subscriber => {
                            sfu.handle_subscriber_ice(webinar_id, &client_id, payload.candidate)
                                .await
                        }
                    };
                    if let Err(err) = result {
                        tracing::debug!("ice candidate rejected: {}", err);
                    }
                });
            }
            ClientEvent::AskQuestion(v) => self.relay_broadcast("ask_question", v),
            ClientEvent::ApproveQuestion(v) => self.relay_broadcast("approve_question", v),
            ClientEvent::LaunchPoll(v) => self.relay_broadcast("launch_poll", v),
            ClientEvent::AnswerPoll(v) => self.relay_broadcast("answer_poll", v),
            ClientEvent::RotateAd(v) => self.relay_broadcast("rotate_ad", v),
            ClientEvent::ChatMessage(v) => {
                // Publish only: the bus subscription callback is the single
                // delivery path, so local clients see the message exactly once.
                actix::spawn(async move {
                    hub.publish_only(webinar_id, "chat_message", v).await;
                });
            }
            ClientEvent::Unknown => {}
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(OUTBOUND_QUEUE_SIZE);
        let client = Client::new(
            self.webinar_id,
            self.user_id,
            self.role,
            ctx.address().recipient(),
        );
        self.client = Some(client.clone());
        let hub = self.hub.clone();
        actix::spawn(async move {
            hub.register(client).await;
        });
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(client) = self.client.take() {
            let hub = self.hub.clone();
            let sfu = self.sfu.clone();
            actix::spawn(async move {
                // SFU first: subscriber teardown runs while the hub still
                // knows the client.
                sfu.unregister_client(client.webinar_id, &client.id).await;
                hub.unregister(&client);
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.dispatch(event),
                    Err(err) => {
                        // A well-formed envelope with a bad payload is
                        // ignored; anything else is a malformed frame.
                        if serde_json::from_str::<WsMessage>(&text).is_ok() {
                            tracing::debug!("ignoring malformed payload: {}", err);
                        } else {
                            ctx.close(None);
                            ctx.stop();
                        }
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<WsMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: WsMessage, ctx: &mut Self::Context) {
        if let Ok(body) = serde_json::to_string(&msg) {
            ctx.text(body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_event_parses_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"event": "join"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Join));
    }

    #[test]
    fn publisher_offer_parses_sdp() {
        let raw = r#"{"event": "webrtc_publisher_offer", "data": {"type": "offer", "sdp": "v=0"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::WebrtcPublisherOffer(payload) => {
                assert_eq!(payload.sdp_type, "offer");
                assert_eq!(payload.sdp, "v=0");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ice_event_parses_target_and_candidate() {
        let raw = r#"{"event": "webrtc_ice", "data": {"target": "subscriber", "candidate": {"candidate": "candidate:1 1 UDP 1 127.0.0.1 5000 typ host"}}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::WebrtcIce(payload) => {
                assert_eq!(payload.target, IceTarget::Subscriber);
                assert!(payload.candidate.candidate.starts_with("candidate:1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chat_message_keeps_payload_verbatim() {
        let raw = r#"{"event": "chat_message", "data": {"text": "hi", "extra": [1, 2]}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::ChatMessage(v) => {
                assert_eq!(v["text"], "hi");
                assert_eq!(v["extra"][1], 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_parses_to_unknown() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event": "made_up", "data": {"x": 1}}"#).unwrap();
        assert!(matches!(event, ClientEvent::Unknown));
    }

    #[test]
    fn bad_payload_for_known_event_fails_parse() {
        let raw = r#"{"event": "webrtc_publisher_offer", "data": {"nope": true}}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
        // But it is still a well-formed envelope.
        assert!(serde_json::from_str::<WsMessage>(raw).is_ok());
    }
}
