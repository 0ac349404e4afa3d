use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::StoreError;
use crate::server::store::{Change, ChangeEvent, ChangeFeed, ChangeOrigin};

pub const DEFAULT_CHANNEL: &str = "listing_inbox:changes";
const RECONNECT_DELAY_SECS: u64 = 5;

/// Wire format on the pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub event: ChangeEvent,
}

impl RelayEnvelope {
    pub fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a payload from the channel, dropping our own echoes and garbage.
    pub fn decode_remote(payload: &str, own_origin: Uuid) -> Option<ChangeEvent> {
        match serde_json::from_str::<RelayEnvelope>(payload) {
            Ok(envelope) if envelope.origin == own_origin => None,
            Ok(envelope) => Some(envelope.event),
            Err(e) => {
                warn!("[RELAY] ignoring malformed payload: {}", e);
                None
            }
        }
    }
}

/// Mirrors a store's [`ChangeFeed`] across processes through redis pub/sub, so
/// live subscriptions in one process see writes made by another process
/// against the same database.
///
/// Publishing is best-effort: a redis failure is logged and never reaches the
/// writer that produced the change.
pub struct RedisChangeRelay {
    origin: Uuid,
    redis_url: String,
    channel: String,
    manager: ConnectionManager,
    feed: ChangeFeed,
}

impl RedisChangeRelay {
    pub async fn connect(
        redis_url: &str,
        channel: &str,
        feed: ChangeFeed,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            origin: Uuid::new_v4(),
            redis_url: redis_url.to_string(),
            channel: channel.to_string(),
            manager,
            feed,
        })
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Spawn the publisher (local feed → redis) and subscriber (redis → local feed).
    pub fn start(self) -> RelayHandle {
        info!("[RELAY] relaying changes on '{}' as {}", self.channel, self.origin);
        let publisher = tokio::spawn(run_publisher(
            self.manager,
            self.channel.clone(),
            self.origin,
            self.feed.subscribe(),
        ));
        let subscriber = tokio::spawn(run_subscriber(
            self.redis_url,
            self.channel,
            self.origin,
            self.feed,
        ));
        RelayHandle {
            publisher,
            subscriber,
        }
    }
}

/// Stops both relay tasks when dropped.
pub struct RelayHandle {
    publisher: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

impl RelayHandle {
    pub fn shutdown(self) {
        self.publisher.abort();
        self.subscriber.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.publisher.abort();
        self.subscriber.abort();
    }
}

async fn run_publisher(
    mut manager: ConnectionManager,
    channel: String,
    origin: Uuid,
    mut changes: broadcast::Receiver<Change>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[RELAY] publisher lagged, {} local changes not relayed", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        // Remote changes came from redis; publishing them again would echo forever.
        if change.origin == ChangeOrigin::Remote {
            continue;
        }
        let payload = match (RelayEnvelope { origin, event: change.event }).encode() {
            Ok(p) => p,
            Err(e) => {
                warn!("[RELAY] could not encode change: {}", e);
                continue;
            }
        };
        let published: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(&mut manager)
            .await;
        match published {
            Ok(()) => debug!("[RELAY] published {}", payload),
            Err(e) => warn!("[RELAY] publish failed, continuing: {}", e),
        }
    }
}

async fn run_subscriber(redis_url: String, channel: String, origin: Uuid, feed: ChangeFeed) {
    loop {
        match redis::Client::open(redis_url.as_str()) {
            Ok(client) => match client.get_async_connection().await {
                Ok(con) => {
                    let mut pubsub = con.into_pubsub();
                    if let Err(e) = pubsub.subscribe(&channel).await {
                        warn!("[RELAY] subscribe to '{}' failed: {}", channel, e);
                    } else {
                        info!("[RELAY] subscribed to '{}'", channel);
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            if let Some(event) = RelayEnvelope::decode_remote(&payload, origin) {
                                debug!("[RELAY] remote change for {}", event.conversation_id());
                                feed.publish_remote(event);
                            }
                        }
                        warn!("[RELAY] redis stream ended");
                    }
                }
                Err(e) => warn!("[RELAY] failed to connect to redis: {}", e),
            },
            Err(e) => warn!("[RELAY] invalid redis url: {}", e),
        }
        info!("[RELAY] subscriber disconnected, retrying in {} seconds", RECONNECT_DELAY_SECS);
        tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}
