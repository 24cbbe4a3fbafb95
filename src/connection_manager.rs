//! Maps `user_id → set of live transports` on this node, and bridges to
//! the cross-node pub/sub fabric when one is configured.
//!
//! A `DashMap`-backed registry keyed by user id, built to avoid "stale
//! cleanup races a newer connection" bugs: a user may hold several
//! concurrent transports at once, so the per-entry identity is each
//! transport's own `id()` rather than a single slot or counter — removal
//! must target the exact transport instance, not merely "the current one".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use rmpv::Value;

use crate::codec;
use crate::transport::Transport;

const CHANNEL_NAME: &str = "ephaptic:broadcast";

#[derive(Clone)]
struct TransportHandle(Arc<dyn Transport>);

impl PartialEq for TransportHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}
impl Eq for TransportHandle {}

impl std::hash::Hash for TransportHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id().hash(state);
    }
}

/// Owns the local `active` map and, when configured, the pub/sub
/// publisher and subscription task.
pub struct ConnectionManager {
    active: DashMap<String, DashSet<TransportHandle>>,
    redis_client: Option<redis::Client>,
    publish_conn: tokio::sync::Mutex<Option<redis::aio::ConnectionManager>>,
    subscription_started: AtomicBool,
}

impl ConnectionManager {
    pub fn local_only() -> Arc<Self> {
        Arc::new(Self {
            active: DashMap::new(),
            redis_client: None,
            publish_conn: tokio::sync::Mutex::new(None),
            subscription_started: AtomicBool::new(false),
        })
    }

    pub async fn with_redis(redis_url: &str) -> Result<Arc<Self>, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = redis::aio::ConnectionManager::new(client.clone()).await?;

        let manager = Arc::new(Self {
            active: DashMap::new(),
            redis_client: Some(client),
            publish_conn: tokio::sync::Mutex::new(Some(publish_conn)),
            subscription_started: AtomicBool::new(false),
        });
        manager.clone().ensure_subscription();
        Ok(manager)
    }

    pub fn add(&self, user_id: &str, transport: Arc<dyn Transport>) {
        self.active
            .entry(user_id.to_string())
            .or_insert_with(DashSet::new)
            .insert(TransportHandle(transport));
    }

    pub fn remove(&self, user_id: &str, transport: &Arc<dyn Transport>) {
        let Some(set) = self.active.get(user_id) else { return };
        set.remove(&TransportHandle(transport.clone()));
        let now_empty = set.is_empty();
        drop(set);
        if now_empty {
            self.active.remove_if(user_id, |_, set| set.is_empty());
        }
    }

    /// Deliver an event to every live transport of every user in
    /// `user_ids`. With a pub/sub client configured, this *only*
    /// publishes — local delivery happens when this node's own
    /// subscription task receives the envelope back, same as every other
    /// node.
    pub async fn broadcast(&self, user_ids: &[String], event_name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) {
        if let Some(client) = &self.redis_client {
            let envelope = codec::broadcast_envelope(user_ids, event_name, args, kwargs);
            let bytes = match codec::encode(&envelope) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode broadcast envelope");
                    return;
                }
            };
            self.publish(client, bytes).await;
        } else {
            let envelope = codec::broadcast_envelope(user_ids, event_name, args, kwargs);
            match codec::encode(&envelope) {
                Ok(bytes) => self.deliver_local(user_ids, bytes),
                Err(e) => tracing::error!(error = %e, "failed to encode broadcast envelope"),
            }
        }
    }

    async fn publish(&self, client: &redis::Client, payload: Vec<u8>) {
        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            *guard = redis::aio::ConnectionManager::new(client.clone()).await.ok();
        }
        let Some(conn) = guard.as_mut() else {
            tracing::error!("no redis connection available to publish broadcast");
            return;
        };
        if let Err(e) = redis::AsyncCommands::publish::<_, _, ()>(conn, CHANNEL_NAME, payload).await {
            tracing::error!(error = %e, "failed to publish broadcast envelope");
        }
    }

    fn deliver_local(&self, user_ids: &[String], payload: Vec<u8>) {
        for user_id in user_ids {
            let Some(set) = self.active.get(user_id) else { continue };
            for handle in set.iter() {
                let transport = handle.0.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _ = transport.send(payload).await;
                });
            }
        }
    }

    /// Start the subscription task once per process. Idempotent: later
    /// calls (e.g. from a second `with_redis` caller sharing this
    /// instance) are no-ops.
    fn ensure_subscription(self: Arc<Self>) {
        if self.subscription_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.redis_client.clone() else { return };
        tokio::spawn(async move {
            if let Err(e) = self.run_subscription(client).await {
                tracing::error!(error = %e, "broadcast subscription loop exited");
            }
        });
    }

    async fn run_subscription(&self, client: redis::Client) -> Result<(), redis::RedisError> {
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(CHANNEL_NAME).await?;
        let mut messages = pubsub.on_message();

        while let Some(msg) = messages.next().await {
            let payload: Vec<u8> = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed broadcast payload");
                    continue;
                }
            };
            let value = match codec::decode(&payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable broadcast envelope");
                    continue;
                }
            };
            let Some((targets, _name, _args, _kwargs)) = codec::parse_broadcast_envelope(&value) else {
                tracing::warn!("broadcast envelope missing required fields");
                continue;
            };
            self.deliver_local(&targets, payload);
        }
        Ok(())
    }
}

#[cfg(test)]
impl ConnectionManager {
    pub(crate) fn session_count_for(&self, user_id: &str) -> usize {
        self.active.get(user_id).map(|set| set.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[tokio::test]
    async fn add_remove_respects_at_most_one_membership() {
        let manager = ConnectionManager::local_only();
        let (transport, _peer) = ChannelTransport::pair();
        let transport: Arc<dyn Transport> = transport;

        manager.add("alice", transport.clone());
        manager.add("alice", transport.clone());
        assert_eq!(manager.active.get("alice").unwrap().len(), 1);

        manager.remove("alice", &transport);
        assert!(manager.active.get("alice").is_none(), "empty entries must be pruned");
    }

    #[tokio::test]
    async fn removing_one_transport_does_not_disturb_a_sibling_session() {
        let manager = ConnectionManager::local_only();
        let (t1, _p1) = ChannelTransport::pair();
        let (t2, _p2) = ChannelTransport::pair();
        let t1: Arc<dyn Transport> = t1;
        let t2: Arc<dyn Transport> = t2;

        manager.add("alice", t1.clone());
        manager.add("alice", t2.clone());
        manager.remove("alice", &t1);

        let set = manager.active.get("alice").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&TransportHandle(t2)));
    }

    #[tokio::test]
    async fn local_broadcast_delivers_to_every_session_of_every_target() {
        let manager = ConnectionManager::local_only();
        let (t1, p1) = ChannelTransport::pair();
        let (t2, p2) = ChannelTransport::pair();
        manager.add("alice", t1);
        manager.add("bob", t2);

        manager
            .broadcast(&["alice".to_string(), "bob".to_string()], "Ping", vec![], HashMap::new())
            .await;

        let got1 = p1.from_transport.lock().await.recv().await.unwrap();
        let got2 = p2.from_transport.lock().await.recv().await.unwrap();
        let value1 = codec::decode(&got1).unwrap();
        let value2 = codec::decode(&got2).unwrap();
        let (_, name1, ..) = codec::parse_broadcast_envelope(&value1).unwrap();
        let (_, name2, ..) = codec::parse_broadcast_envelope(&value2).unwrap();
        assert_eq!(name1, "Ping");
        assert_eq!(name2, "Ping");
    }
}
