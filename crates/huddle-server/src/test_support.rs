use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use huddle_shared::protocol::ServerFrame;
use huddle_shared::{ConversationId, UserId};
use huddle_store::{Conversation, Database};

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::identity::{IdentityProvider, Profile};
use crate::state::AppState;
use crate::store::Store;

pub(crate) fn profile(id: &str) -> Profile {
    Profile {
        id: UserId::from(id),
        username: format!("{id}-name"),
        name: None,
        avatar: None,
        color: None,
        public_key: None,
    }
}

/// Accepts `token-<id>` for any id; follows `bob` and `carol`.
pub(crate) struct FakeIdentity;

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn authenticate(&self, credential: &str) -> Result<Profile, ChatError> {
        credential
            .strip_prefix("token-")
            .filter(|id| !id.is_empty())
            .map(profile)
            .ok_or(ChatError::AuthenticationFailed)
    }

    async fn get_followings(
        &self,
        _user_id: &UserId,
        _credential: &str,
        _page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        Ok(vec![profile("bob"), profile("carol")])
    }

    async fn search(
        &self,
        _user_id: &UserId,
        _credential: &str,
        query: &str,
        _page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        Ok(["alice", "bob", "carol"]
            .iter()
            .filter(|id| id.contains(query))
            .map(|id| profile(id))
            .collect())
    }
}

pub(crate) struct TestApp {
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let db = Database::open_in_memory().unwrap();
        Self {
            state: AppState::new(config, db, Arc::new(FakeIdentity)),
        }
    }
}

/// Everything queued so far, without waiting.
pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Payloads of the pushes named `name`.
pub(crate) fn pushes_named(frames: &[ServerFrame], name: &str) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerFrame::Push { event, data } if event == name => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// The reply carrying `id`, if any.
pub(crate) fn reply_for(frames: &[ServerFrame], id: u64) -> Option<Value> {
    frames.iter().find_map(|frame| match frame {
        ServerFrame::Reply { id: reply_id, data } if *reply_id == id => Some(data.clone()),
        _ => None,
    })
}

pub(crate) async fn seed_user(store: &Store, id: &str) {
    let user = profile(id).into_user();
    store.call(move |db| db.upsert_user(&user)).await.unwrap();
}

pub(crate) async fn seed_conversation(
    store: &Store,
    creator: &str,
    participants: &[&str],
) -> ConversationId {
    let now = Utc::now();
    let conversation = Conversation {
        id: ConversationId::generate(),
        name: None,
        avatar: None,
        created_by: Some(UserId::from(creator)),
        is_public: false,
        participants: participants.iter().map(|id| UserId::from(*id)).collect(),
        created_at: now,
        updated_at: now,
    };
    let id = conversation.id.clone();
    store
        .call(move |db| db.create_conversation(&conversation))
        .await
        .unwrap();
    id
}
