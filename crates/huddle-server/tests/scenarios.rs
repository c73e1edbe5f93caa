//! End-to-end behaviour through the connection gateway, with an in-process
//! identity provider and connections backed by plain channels.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use huddle_server::config::ServerConfig;
use huddle_server::error::ChatError;
use huddle_server::gateway::ConnectionSession;
use huddle_server::identity::{IdentityProvider, Profile};
use huddle_server::registry::ConnectionHandle;
use huddle_server::state::AppState;
use huddle_shared::protocol::{InboundFrame, ServerFrame};
use huddle_shared::{ConversationId, UserId};
use huddle_store::Database;

struct Directory;

#[async_trait]
impl IdentityProvider for Directory {
    async fn authenticate(&self, credential: &str) -> Result<Profile, ChatError> {
        let id = credential
            .strip_prefix("token-")
            .ok_or(ChatError::AuthenticationFailed)?;
        Ok(Profile {
            id: UserId::from(id),
            username: id.to_uppercase(),
            name: None,
            avatar: None,
            color: None,
            public_key: None,
        })
    }

    async fn get_followings(
        &self,
        _user_id: &UserId,
        _credential: &str,
        _page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        Ok(Vec::new())
    }

    async fn search(
        &self,
        _user_id: &UserId,
        _credential: &str,
        _query: &str,
        _page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        Ok(Vec::new())
    }
}

fn app_with(db: Database) -> AppState {
    AppState::new(ServerConfig::default(), db, Arc::new(Directory))
}

fn app() -> AppState {
    app_with(Database::open_in_memory().unwrap())
}

/// One device: a gateway session plus the receiving end of its queue.
struct Device {
    session: ConnectionSession,
    rx: mpsc::Receiver<ServerFrame>,
    pending: Vec<ServerFrame>,
    next_id: u64,
}

impl Device {
    async fn connect(app: &AppState, user: &str) -> Self {
        let (conn, rx) = ConnectionHandle::channel(256);
        let mut device = Self {
            session: ConnectionSession::new(app.clone(), conn),
            rx,
            pending: Vec::new(),
            next_id: 0,
        };
        let reply = device.request("authenticate", json!(format!("token-{user}"))).await;
        assert_eq!(reply["success"], true, "authentication failed: {reply}");
        device
    }

    /// Send a request and return its reply. Pushes received meanwhile stay
    /// queued for [`pushes`](Self::pushes).
    async fn request(&mut self, event: &str, data: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let frame = InboundFrame {
            id: Some(id),
            event: event.to_string(),
            data,
        };
        if let Some(task) = self.session.handle_frame(frame).await {
            task.await.unwrap();
        }

        let mut reply = None;
        let mut rest = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            match frame {
                ServerFrame::Reply { id: reply_id, data } if reply_id == id => reply = Some(data),
                other => rest.push(other),
            }
        }
        self.pending.extend(rest);
        reply.unwrap_or_else(|| panic!("no reply to {event}"))
    }

    fn pushes(&mut self, name: &str) -> Vec<Value> {
        while let Ok(frame) = self.rx.try_recv() {
            self.pending.push(frame);
        }
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|f| matches!(f, ServerFrame::Push { event, .. } if event == name));
        self.pending = rest;
        matching
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Push { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    async fn disconnect(mut self) {
        self.session.close().await;
    }
}

fn unread_for(reply: &Value, conversation: &Value) -> Option<u64> {
    reply["conversations"]
        .as_array()?
        .iter()
        .find(|c| &c["conversationId"] == conversation)
        .and_then(|c| c["unreadCount"].as_u64())
}

async fn create(device: &mut Device, participants: &[&str]) -> Value {
    let reply = device
        .request("conversations:create", json!({ "participantIds": participants }))
        .await;
    assert_eq!(reply["success"], true, "create failed: {reply}");
    reply["conversation"]["id"].clone()
}

#[tokio::test]
async fn message_counts_as_unread_until_marked_read() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut bob = Device::connect(&app, "bob").await;

    let conv = create(&mut alice, &["bob"]).await;
    assert_eq!(bob.pushes("conversations:created").len(), 1);

    let sent = alice
        .request(
            "events:new_message",
            json!({ "conversationId": conv, "text": "hi" }),
        )
        .await;
    assert_eq!(sent["success"], true);

    let created = bob.pushes("events:created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["event"]["text"], "hi");

    let stats = bob.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), Some(1));

    let marked = bob
        .request("events:mark_read", json!({ "conversationId": conv }))
        .await;
    assert_eq!(marked["success"], true);
    assert_eq!(alice.pushes("events:read").len(), 1);

    let stats = bob.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), Some(0));
    // Only alice's arrival in the master conversation is still unread.
    assert_eq!(unread_for(&stats, &json!("master")), Some(1));
    assert_eq!(stats["total"], 1);

    // Marking again changes nothing.
    bob.request("events:mark_read", json!({ "conversationId": conv }))
        .await;
    let stats = bob.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), Some(0));
}

#[tokio::test]
async fn offline_recipient_catches_up_by_fetching() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let bob = Device::connect(&app, "bob").await;
    let conv = create(&mut alice, &["bob"]).await;

    bob.disconnect().await;
    assert!(app
        .registry
        .get_connections(&UserId::from("bob"))
        .await
        .is_empty());

    let sent = alice
        .request(
            "events:new_message",
            json!({ "conversationId": conv, "text": "while you were out" }),
        )
        .await;
    assert_eq!(sent["success"], true);

    let mut bob = Device::connect(&app, "bob").await;
    assert!(bob.pushes("events:created").is_empty());

    let fetched = bob
        .request("events:fetch", json!({ "conversationId": conv }))
        .await;
    let events = fetched["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["text"], "while you were out");
}

#[tokio::test]
async fn only_the_creator_may_block() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut carol = Device::connect(&app, "carol").await;
    let conv = create(&mut alice, &["bob", "carol"]).await;

    let denied = carol
        .request(
            "conversations:block",
            json!({ "conversationId": conv, "participantIds": ["bob"] }),
        )
        .await;
    assert_eq!(denied["success"], false);
    assert!(denied["error"].as_str().unwrap().starts_with("Forbidden"));

    let id = ConversationId(conv.as_str().unwrap().to_string());
    let participants = app
        .store
        .call(move |db| db.participants(&id))
        .await
        .unwrap();
    assert_eq!(participants.len(), 3);
}

#[tokio::test]
async fn outsiders_cannot_post_and_nothing_is_written() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut mallory = Device::connect(&app, "mallory").await;
    let conv = create(&mut alice, &["bob"]).await;

    let denied = mallory
        .request(
            "events:new_message",
            json!({ "conversationId": conv, "text": "let me in", "nonce": 5 }),
        )
        .await;
    assert_eq!(denied["success"], false);
    assert_eq!(denied["nonce"], 5);

    let fetched = alice
        .request("events:fetch", json!({ "conversationId": conv }))
        .await;
    assert!(fetched["events"].as_array().unwrap().is_empty());

    let stats = mallory.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), None);
}

#[tokio::test]
async fn join_succeeds_only_for_public_conversations() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut dave = Device::connect(&app, "dave").await;

    let private = create(&mut alice, &[]).await;
    let denied = dave
        .request("conversations:join", json!({ "conversationId": private }))
        .await;
    assert_eq!(denied["success"], false);

    alice
        .request(
            "conversations:setPublic",
            json!({ "conversationId": private, "isPublic": true }),
        )
        .await;
    let joined = dave
        .request("conversations:join", json!({ "conversationId": private }))
        .await;
    assert_eq!(joined["success"], true);
    assert_eq!(alice.pushes("conversations:updated").len(), 1);
}

#[tokio::test]
async fn every_device_receives_each_broadcast_once() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut phone = Device::connect(&app, "bob").await;
    let mut laptop = Device::connect(&app, "bob").await;
    let conv = create(&mut alice, &["bob"]).await;

    alice
        .request("events:typing", json!({ "conversationId": conv }))
        .await;

    assert_eq!(phone.pushes("events:typing").len(), 1);
    assert_eq!(laptop.pushes("events:typing").len(), 1);
    assert_eq!(alice.pushes("events:typing").len(), 1);
}

#[tokio::test]
async fn leaving_hides_the_conversation_from_stats() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut bob = Device::connect(&app, "bob").await;
    let conv = create(&mut alice, &["bob"]).await;
    alice
        .request(
            "events:new_message",
            json!({ "conversationId": conv, "text": "hello" }),
        )
        .await;

    let left = bob
        .request("conversations:delete", json!({ "conversationId": conv }))
        .await;
    assert_eq!(left["success"], true);

    let stats = bob.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), None);

    let events = alice
        .request("events:fetch", json!({ "conversationId": conv }))
        .await;
    assert_eq!(events["events"][0]["type"], "LEAVE");
}

#[tokio::test]
async fn registering_announces_a_join_in_the_master_conversation() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let bob = Device::connect(&app, "bob").await;

    let arrivals = alice.pushes("events:created");
    assert_eq!(arrivals.len(), 1);
    assert_eq!(arrivals[0]["event"]["type"], "JOIN");
    assert_eq!(arrivals[0]["event"]["ownerId"], "bob");

    // Returning users do not arrive again.
    bob.disconnect().await;
    let _bob = Device::connect(&app, "bob").await;
    assert!(alice.pushes("events:created").is_empty());

    let history = alice
        .request("events:fetch", json!({ "conversationId": "master" }))
        .await;
    let owners: Vec<_> = history["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| (e["type"].clone(), e["ownerId"].clone()))
        .collect();
    assert_eq!(
        owners,
        vec![(json!("JOIN"), json!("bob")), (json!("JOIN"), json!("alice"))]
    );
}

#[tokio::test]
async fn listing_names_conversations_per_viewer() {
    let app = app();
    let mut alice = Device::connect(&app, "alice").await;
    let mut bob = Device::connect(&app, "bob").await;
    let conv = create(&mut alice, &["bob"]).await;

    let listed = bob.request("conversations:fetch", Value::Null).await;
    let conversations = listed["conversations"].as_array().unwrap();
    let direct = conversations.iter().find(|c| c["id"] == conv).unwrap();
    assert_eq!(direct["name"], "ALICE");

    let master = conversations.iter().find(|c| c["id"] == "master").unwrap();
    assert_eq!(master["name"], "All Users");
}

#[tokio::test]
async fn history_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huddle.db");

    let conv = {
        let app = app_with(Database::open_at(&path).unwrap());
        let mut alice = Device::connect(&app, "alice").await;
        let conv = create(&mut alice, &["bob"]).await;
        alice
            .request(
                "events:new_message",
                json!({ "conversationId": conv, "text": "persisted" }),
            )
            .await;
        conv
    };

    let app = app_with(Database::open_at(&path).unwrap());
    let mut bob = Device::connect(&app, "bob").await;
    let stats = bob.request("events:get_unread_count", Value::Null).await;
    assert_eq!(unread_for(&stats, &conv), Some(1));
}
