use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

const CHANNEL_PREFIX: &str = "webinar:";
const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// Message envelope replicated across instances for one webinar channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: serde_json::Value,
    pub at: i64,
}

/// Handler invoked once per received envelope with the event name and payload.
pub type EventHandler = Arc<dyn Fn(String, serde_json::Value) + Send + Sync>;

/// Redis-backed bridge that fans webinar-scoped events out to every server
/// instance. Per-channel ordering is preserved; malformed envelopes are
/// dropped.
pub struct EventBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish()
    }
}

pub fn channel_name(webinar_id: Uuid) -> String {
    format!("{CHANNEL_PREFIX}{webinar_id}")
}

impl EventBus {
    pub async fn new(client: redis::Client) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    /// Publish an event envelope on the webinar's channel. Transport failures
    /// surface to the caller, which logs and continues.
    pub async fn publish(
        &self,
        webinar_id: Uuid,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let envelope = Envelope {
            event: event.to_owned(),
            data: payload,
            at: Utc::now().timestamp(),
        };
        let body = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            PUBLISH_DEADLINE,
            conn.publish::<_, _, ()>(channel_name(webinar_id), body),
        )
        .await
        .map_err(|_| Error::Transport("pubsub publish deadline exceeded".to_owned()))??;
        Ok(())
    }

    /// Subscribe to a webinar's channel. The handler runs on a dedicated
    /// delivery loop until the returned token is cancelled; a dropped
    /// connection ends the subscription (callers resubscribe).
    pub async fn subscribe(
        &self,
        webinar_id: Uuid,
        handler: EventHandler,
    ) -> Result<CancellationToken> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = channel_name(webinar_id);
        pubsub.subscribe(&channel).await?;

        let token = CancellationToken::new();
        let child = token.child_token();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        break;
                    }
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            tracing::warn!("pubsub stream closed for {}", channel);
                            break;
                        };
                        let Ok(payload) = msg.get_payload::<String>() else {
                            continue;
                        };
                        match serde_json::from_str::<Envelope>(&payload) {
                            Ok(envelope) => handler(envelope.event, envelope.data),
                            Err(_) => continue,
                        }
                    }
                }
            }
            tracing::debug!("pubsub delivery loop for {} finished", channel);
        });

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_is_prefixed() {
        let id = Uuid::nil();
        assert_eq!(
            channel_name(id),
            "webinar:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            event: "chat_message".to_owned(),
            data: serde_json::json!({"text": "hi"}),
            at: 1_700_000_000,
        };
        let body = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.event, "chat_message");
        assert_eq!(parsed.data["text"], "hi");
        assert_eq!(parsed.at, 1_700_000_000);
    }

    #[test]
    fn malformed_envelope_is_error() {
        assert!(serde_json::from_str::<Envelope>("{\"event\": 1}").is_err());
    }
}
