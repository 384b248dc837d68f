use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use actix::prelude::{Message, Recipient};
use chrono::{DateTime, Utc};
use derivative::Derivative;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::Role;
use crate::pubsub::EventBus;

/// Outbound WebSocket envelope. Doubles as the actor message delivered to a
/// session's mailbox.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Message)]
#[rtype(result = "()")]
pub struct WsMessage {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One WebSocket connection registered in a room. The recipient's mailbox is
/// the client's bounded outbound queue; enqueueing never blocks and drops
/// when full.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Client {
    pub id: String,
    pub webinar_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[derivative(Debug = "ignore")]
    addr: Recipient<WsMessage>,
}

impl Client {
    pub fn new(
        webinar_id: Uuid,
        user_id: Uuid,
        role: Role,
        addr: Recipient<WsMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            webinar_id,
            user_id,
            role,
            joined_at: Utc::now(),
            addr,
        }
    }

    fn enqueue(&self, msg: WsMessage) {
        // Mailbox full means a slow consumer; this message is lost for them.
        let _ = self.addr.try_send(msg);
    }
}

pub type AudienceChangeHandler = Box<dyn Fn(Uuid, usize) + Send + Sync>;
pub type SessionJoinHandler = Box<dyn Fn(Uuid, Uuid) + Send + Sync>;
pub type SessionLeaveHandler = Box<dyn Fn(Uuid, Uuid, DateTime<Utc>) + Send + Sync>;

/// Maintains `webinar_id -> clients` and fans control events out locally and,
/// through the [`EventBus`], across instances. One bus subscription per room,
/// opened with the first local client and cancelled with the last.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Hub {
    rooms: RwLock<HashMap<Uuid, HashMap<String, Client>>>,
    subscriptions: RwLock<HashMap<Uuid, CancellationToken>>,
    #[derivative(Debug = "ignore")]
    bus: Option<Arc<EventBus>>,
    #[derivative(Debug = "ignore")]
    on_audience_change: RwLock<Option<AudienceChangeHandler>>,
    #[derivative(Debug = "ignore")]
    on_session_join: RwLock<Option<SessionJoinHandler>>,
    #[derivative(Debug = "ignore")]
    on_session_leave: RwLock<Option<SessionLeaveHandler>>,
    self_ref: Weak<Hub>,
}

impl Hub {
    pub fn new(bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            rooms: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            bus,
            on_audience_change: RwLock::new(None),
            on_session_join: RwLock::new(None),
            on_session_leave: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Set the audience-count callback. Called once at startup.
    pub fn set_audience_change_handler(&self, handler: AudienceChangeHandler) {
        *self.on_audience_change.write().unwrap() = Some(handler);
    }

    /// Set the session-log callbacks. Called once at startup.
    pub fn set_session_logger(&self, join: SessionJoinHandler, leave: SessionLeaveHandler) {
        *self.on_session_join.write().unwrap() = Some(join);
        *self.on_session_leave.write().unwrap() = Some(leave);
    }

    /// Insert a client into its room. The first client of a room opens the
    /// bus subscription whose handler rebroadcasts to local clients.
    pub async fn register(&self, client: Client) {
        let webinar_id = client.webinar_id;
        let user_id = client.user_id;
        let client_id = client.id.clone();

        let (count, first_in_room) = {
            let mut rooms = self.rooms.write().unwrap();
            let first = !rooms.contains_key(&webinar_id);
            let room = rooms.entry(webinar_id).or_default();
            room.insert(client.id.clone(), client);
            (room.len(), first)
        };

        if first_in_room {
            if let (Some(bus), Some(hub)) = (&self.bus, self.self_ref.upgrade()) {
                let handler = Arc::new(move |event: String, payload: serde_json::Value| {
                    hub.broadcast_local(webinar_id, &event, payload);
                });
                match bus.subscribe(webinar_id, handler).await {
                    Ok(cancel) => {
                        self.subscriptions
                            .write()
                            .unwrap()
                            .insert(webinar_id, cancel.clone());
                        // The room may have emptied while the subscription was
                        // opening; drop it again to keep room and subscription
                        // lifetimes aligned.
                        if !self.rooms.read().unwrap().contains_key(&webinar_id) {
                            if self
                                .subscriptions
                                .write()
                                .unwrap()
                                .remove(&webinar_id)
                                .is_some()
                            {
                                cancel.cancel();
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("failed to subscribe webinar {}: {}", webinar_id, err);
                    }
                }
            }
        }

        if let Some(handler) = self.on_audience_change.read().unwrap().as_ref() {
            handler(webinar_id, count);
        }
        if let Some(handler) = self.on_session_join.read().unwrap().as_ref() {
            handler(webinar_id, user_id);
        }
        tracing::debug!("client {} joined webinar {}", client_id, webinar_id);
    }

    /// Remove a client; cancels the room's bus subscription when the room
    /// empties. The audience callback fires only while a nonzero count
    /// remains.
    pub fn unregister(&self, client: &Client) {
        let mut count = 0;
        let mut removed_room = false;
        {
            let mut rooms = self.rooms.write().unwrap();
            if let Some(room) = rooms.get_mut(&client.webinar_id) {
                room.remove(&client.id);
                count = room.len();
                if count == 0 {
                    rooms.remove(&client.webinar_id);
                    removed_room = true;
                }
            }
        }
        if removed_room {
            if let Some(cancel) = self
                .subscriptions
                .write()
                .unwrap()
                .remove(&client.webinar_id)
            {
                cancel.cancel();
            }
        }

        if count > 0 {
            if let Some(handler) = self.on_audience_change.read().unwrap().as_ref() {
                handler(client.webinar_id, count);
            }
        }
        if let Some(handler) = self.on_session_leave.read().unwrap().as_ref() {
            handler(client.webinar_id, client.user_id, client.joined_at);
        }
        tracing::debug!(
            "client {} left webinar {}",
            client.id,
            client.webinar_id
        );
    }

    /// Deliver to every local client in the room by non-blocking enqueue.
    pub fn broadcast_local(&self, webinar_id: Uuid, event: &str, payload: serde_json::Value) {
        let msg = WsMessage {
            event: event.to_owned(),
            data: Some(payload),
        };
        let rooms = self.rooms.read().unwrap();
        if let Some(room) = rooms.get(&webinar_id) {
            for client in room.values() {
                client.enqueue(msg.clone());
            }
        }
    }

    /// Deliver locally and replicate to other instances. Used for operator
    /// actions whose local result is already computed.
    pub async fn broadcast_and_publish(
        &self,
        webinar_id: Uuid,
        event: &str,
        payload: serde_json::Value,
    ) {
        self.broadcast_local(webinar_id, event, payload.clone());
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(webinar_id, event, payload).await {
                tracing::warn!("pubsub publish failed for {}: {}", event, err);
            }
        }
    }

    /// Replicate only; the bus subscription callback is the single delivery
    /// path so origin-bound events (chat, questions) reach every client
    /// exactly once. Falls back to a local broadcast when no bus is
    /// configured.
    pub async fn publish_only(&self, webinar_id: Uuid, event: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(webinar_id, event, payload).await {
                tracing::warn!("pubsub publish failed for {}: {}", event, err);
            }
            return;
        }
        self.broadcast_local(webinar_id, event, payload);
    }

    /// Point-to-point delivery for WebRTC signaling; never broadcast.
    pub fn send_to_client(
        &self,
        webinar_id: Uuid,
        client_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) {
        let msg = WsMessage {
            event: event.to_owned(),
            data: Some(payload),
        };
        let rooms = self.rooms.read().unwrap();
        if let Some(client) = rooms.get(&webinar_id).and_then(|r| r.get(client_id)) {
            client.enqueue(msg);
        }
    }

    /// Number of locally connected clients in the room.
    pub fn audience_count(&self, webinar_id: Uuid) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(&webinar_id)
            .map_or(0, HashMap::len)
    }

    /// Whether a bus subscription is currently open for the room.
    pub fn has_subscription(&self, webinar_id: Uuid) -> bool {
        self.subscriptions.read().unwrap().contains_key(&webinar_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::prelude::*;
    use enclose::enc;
    use std::sync::Mutex;

    /// Collects everything delivered to its mailbox.
    struct Collector {
        received: Arc<Mutex<Vec<WsMessage>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<WsMessage> for Collector {
        type Result = ();

        fn handle(&mut self, msg: WsMessage, _ctx: &mut Self::Context) {
            self.received.lock().unwrap().push(msg);
        }
    }

    fn spawn_client(
        webinar_id: Uuid,
        role: Role,
    ) -> (Client, Arc<Mutex<Vec<WsMessage>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector {
            received: received.clone(),
        }
        .start();
        let client = Client::new(webinar_id, Uuid::new_v4(), role, addr.recipient());
        (client, received)
    }

    async fn settle() {
        // Let actor mailboxes drain.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[actix_rt::test]
    async fn register_and_unregister_track_audience_count() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let (a, _) = spawn_client(webinar_id, Role::Audience);
        let (b, _) = spawn_client(webinar_id, Role::Audience);

        hub.register(a.clone()).await;
        assert_eq!(hub.audience_count(webinar_id), 1);
        hub.register(b.clone()).await;
        assert_eq!(hub.audience_count(webinar_id), 2);

        hub.unregister(&a);
        assert_eq!(hub.audience_count(webinar_id), 1);
        hub.unregister(&b);
        assert_eq!(hub.audience_count(webinar_id), 0);
    }

    #[actix_rt::test]
    async fn room_entry_removed_with_last_client() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let (a, _) = spawn_client(webinar_id, Role::Audience);
        hub.register(a.clone()).await;
        hub.unregister(&a);
        assert_eq!(hub.audience_count(webinar_id), 0);
        assert!(!hub.has_subscription(webinar_id));
        // A broadcast to the dead room is a no-op, not a panic.
        hub.broadcast_local(webinar_id, "join", serde_json::json!({}));
    }

    #[actix_rt::test]
    async fn broadcast_local_reaches_every_client() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let (a, got_a) = spawn_client(webinar_id, Role::Audience);
        let (b, got_b) = spawn_client(webinar_id, Role::Audience);
        hub.register(a).await;
        hub.register(b).await;

        hub.broadcast_local(webinar_id, "launch_poll", serde_json::json!({"poll_id": 7}));
        settle().await;

        for got in [got_a, got_b] {
            let msgs = got.lock().unwrap();
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].event, "launch_poll");
            assert_eq!(msgs[0].data.as_ref().unwrap()["poll_id"], 7);
        }
    }

    #[actix_rt::test]
    async fn publish_only_without_bus_delivers_exactly_once() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let (sender, got_sender) = spawn_client(webinar_id, Role::Audience);
        let (other, got_other) = spawn_client(webinar_id, Role::Audience);
        hub.register(sender).await;
        hub.register(other).await;

        hub.publish_only(webinar_id, "chat_message", serde_json::json!({"text": "hi"}))
            .await;
        settle().await;

        assert_eq!(got_sender.lock().unwrap().len(), 1);
        assert_eq!(got_other.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn send_to_client_is_point_to_point() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let (a, got_a) = spawn_client(webinar_id, Role::Speaker);
        let (b, got_b) = spawn_client(webinar_id, Role::Audience);
        let a_id = a.id.clone();
        hub.register(a).await;
        hub.register(b).await;

        hub.send_to_client(
            webinar_id,
            &a_id,
            "webrtc_publisher_answer",
            serde_json::json!({"type": "answer", "sdp": "v=0"}),
        );
        settle().await;

        assert_eq!(got_a.lock().unwrap().len(), 1);
        assert!(got_b.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn audience_callback_sees_monotonic_steps() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let counts = Arc::new(Mutex::new(Vec::new()));
        hub.set_audience_change_handler(Box::new(enc!((counts) move |_, count| {
            counts.lock().unwrap().push(count);
        })));

        let (a, _) = spawn_client(webinar_id, Role::Audience);
        let (b, _) = spawn_client(webinar_id, Role::Audience);
        hub.register(a.clone()).await;
        hub.register(b.clone()).await;
        hub.unregister(&a);
        hub.unregister(&b);

        // No callback for the final unregister that empties the room.
        assert_eq!(*counts.lock().unwrap(), vec![1, 2, 1]);
    }

    #[actix_rt::test]
    async fn session_logger_fires_on_join_and_leave() {
        let hub = Hub::new(None);
        let webinar_id = Uuid::new_v4();
        let joins = Arc::new(Mutex::new(Vec::new()));
        let leaves = Arc::new(Mutex::new(Vec::new()));
        hub.set_session_logger(
            Box::new(enc!((joins) move |_, user_id| joins.lock().unwrap().push(user_id))),
            Box::new(enc!((leaves) move |_, user_id, _| leaves.lock().unwrap().push(user_id))),
        );

        let (a, _) = spawn_client(webinar_id, Role::Audience);
        let user_id = a.user_id;
        hub.register(a.clone()).await;
        hub.unregister(&a);

        assert_eq!(*joins.lock().unwrap(), vec![user_id]);
        assert_eq!(*leaves.lock().unwrap(), vec![user_id]);
    }
}
