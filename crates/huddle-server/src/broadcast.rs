//! Push notices out to every live connection of the users concerned.
//!
//! Targets are resolved at emit time: a conversation broadcast reaches the
//! participant set as it is when the broadcast runs, and each participant
//! receives the notice once per open connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use huddle_shared::protocol::ServerFrame;
use huddle_shared::{ConversationId, UserId};

use crate::error::ChatError;
use crate::registry::SessionRegistry;
use crate::store::Store;

/// Who a notice is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutTarget {
    Conversation {
        id: ConversationId,
        exclude: Vec<UserId>,
    },
    User(UserId),
}

/// Hook for forwarding notices to other server instances.
///
/// Connections held by other processes are out of reach of the local
/// registry; a relay receives every notice after local delivery.
#[async_trait]
pub trait ClusterRelay: Send + Sync {
    async fn publish(&self, target: &FanoutTarget, event: &str, payload: &Value);
}

/// Single-process deployment: nothing to forward.
pub struct LocalOnly;

#[async_trait]
impl ClusterRelay for LocalOnly {
    async fn publish(&self, _target: &FanoutTarget, _event: &str, _payload: &Value) {}
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: SessionRegistry,
    store: Store,
    relay: Arc<dyn ClusterRelay>,
}

impl Broadcaster {
    pub fn new(registry: SessionRegistry, store: Store) -> Self {
        Self::with_relay(registry, store, Arc::new(LocalOnly))
    }

    pub fn with_relay(
        registry: SessionRegistry,
        store: Store,
        relay: Arc<dyn ClusterRelay>,
    ) -> Self {
        Self {
            registry,
            store,
            relay,
        }
    }

    /// Deliver to every current participant of `conversation_id` except
    /// those in `exclude`. Returns the number of frames queued locally.
    pub async fn emit_to_conversation(
        &self,
        conversation_id: &ConversationId,
        event: &str,
        payload: Value,
        exclude: &[UserId],
    ) -> Result<usize, ChatError> {
        let conv = conversation_id.clone();
        let participants = self.store.call(move |db| db.participants(&conv)).await?;

        let recipients: Vec<UserId> = participants
            .into_iter()
            .filter(|user| !exclude.contains(user))
            .collect();
        let delivered = self.deliver(&recipients, event, &payload).await;

        debug!(
            conversation = %conversation_id,
            event,
            recipients = recipients.len(),
            delivered,
            "Conversation broadcast"
        );

        let target = FanoutTarget::Conversation {
            id: conversation_id.clone(),
            exclude: exclude.to_vec(),
        };
        self.relay.publish(&target, event, &payload).await;
        Ok(delivered)
    }

    /// Like [`emit_to_conversation`](Self::emit_to_conversation) for a
    /// mutation that is already persisted: failure is logged, not returned.
    pub async fn notify_conversation(
        &self,
        conversation_id: &ConversationId,
        event: &str,
        payload: Value,
        exclude: &[UserId],
    ) -> usize {
        match self
            .emit_to_conversation(conversation_id, event, payload, exclude)
            .await
        {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(
                    conversation = %conversation_id,
                    event,
                    error = %e,
                    "Broadcast failed after commit"
                );
                0
            }
        }
    }

    /// Deliver to every connection of a single user.
    pub async fn emit_to_user(&self, user_id: &UserId, event: &str, payload: Value) -> usize {
        let delivered = self
            .deliver(std::slice::from_ref(user_id), event, &payload)
            .await;
        self.relay
            .publish(&FanoutTarget::User(user_id.clone()), event, &payload)
            .await;
        delivered
    }

    async fn deliver(&self, users: &[UserId], event: &str, payload: &Value) -> usize {
        let frame = ServerFrame::push(event, payload.clone());
        let mut delivered = 0;
        for user in users {
            for conn in self.registry.get_connections(user).await {
                if conn.deliver(frame.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use crate::test_support::{drain, seed_conversation};
    use huddle_store::Database;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(FanoutTarget, String)>>,
    }

    #[async_trait]
    impl ClusterRelay for Recorder {
        async fn publish(&self, target: &FanoutTarget, event: &str, _payload: &Value) {
            self.seen.lock().await.push((target.clone(), event.to_string()));
        }
    }

    #[tokio::test]
    async fn test_each_connection_receives_once() {
        let store = Store::new(Database::open_in_memory().unwrap());
        let registry = SessionRegistry::new();
        let conv = seed_conversation(&store, "alice", &["alice", "bob"]).await;

        let (a1, mut rx_a1) = ConnectionHandle::channel(8);
        let (a2, mut rx_a2) = ConnectionHandle::channel(8);
        let (b1, mut rx_b1) = ConnectionHandle::channel(8);
        let (m1, mut rx_m1) = ConnectionHandle::channel(8);
        registry.add_connection(&UserId::from("alice"), a1).await.unwrap();
        registry.add_connection(&UserId::from("alice"), a2).await.unwrap();
        registry.add_connection(&UserId::from("bob"), b1).await.unwrap();
        registry.add_connection(&UserId::from("mallory"), m1).await.unwrap();

        let broadcaster = Broadcaster::new(registry, store);
        let delivered = broadcaster
            .emit_to_conversation(&conv, "events:typing", json!({}), &[])
            .await
            .unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(drain(&mut rx_a1).len(), 1);
        assert_eq!(drain(&mut rx_a2).len(), 1);
        assert_eq!(drain(&mut rx_b1).len(), 1);
        assert!(drain(&mut rx_m1).is_empty());
    }

    #[tokio::test]
    async fn test_exclusion_and_relay() {
        let store = Store::new(Database::open_in_memory().unwrap());
        let registry = SessionRegistry::new();
        let conv = seed_conversation(&store, "alice", &["alice", "bob"]).await;

        let (a1, mut rx_a1) = ConnectionHandle::channel(8);
        registry.add_connection(&UserId::from("alice"), a1).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let broadcaster = Broadcaster::with_relay(registry, store, recorder.clone());
        let delivered = broadcaster
            .emit_to_conversation(&conv, "events:read", json!({}), &[UserId::from("alice")])
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(drain(&mut rx_a1).is_empty());
        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "events:read");
    }

    #[tokio::test]
    async fn test_emit_to_user_without_connections() {
        let store = Store::new(Database::open_in_memory().unwrap());
        let broadcaster = Broadcaster::new(SessionRegistry::new(), store);
        assert_eq!(
            broadcaster
                .emit_to_user(&UserId::from("nobody"), "conversations:created", json!({}))
                .await,
            0
        );
    }
}
