//! Conversation lifecycle and participant sets.
//!
//! Each mutation is a handful of independent store calls. Two concurrent
//! mutations of one conversation can interleave; membership rows make
//! single adds and removals atomic, anything beyond that is
//! last-writer-wins.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use huddle_shared::constants::MASTER_CONVERSATION_NAME;
use huddle_shared::protocol::notice;
use huddle_shared::{ConversationId, UserId};
use huddle_store::{ChatEvent, Conversation, Database, User};

use crate::broadcast::Broadcaster;
use crate::error::ChatError;
use crate::ledger::{require_participant, EventLedger};
use crate::store::Store;

/// A conversation as one particular viewer sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: ConversationId,
    /// Display name for the viewer.
    pub name: String,
    pub group_name: Option<String>,
    pub avatar: Option<String>,
    pub created_by: Option<UserId>,
    pub is_public: bool,
    pub participant_ids: Vec<UserId>,
    /// Profiles of the participants known to this server.
    pub participants: Vec<User>,
    pub last_event: Option<ChatEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationView {
    fn build(
        conversation: Conversation,
        participants: Vec<User>,
        last_event: Option<ChatEvent>,
        viewer: &UserId,
    ) -> Self {
        let name = display_name(&conversation, &participants, viewer);
        Self {
            id: conversation.id,
            name,
            group_name: conversation.name,
            avatar: conversation.avatar,
            created_by: conversation.created_by,
            is_public: conversation.is_public,
            participant_ids: conversation.participants,
            participants,
            last_event,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

/// Master gets its fixed name, groups their own; otherwise the other
/// participants' usernames, falling back to the viewer's.
fn display_name(conversation: &Conversation, participants: &[User], viewer: &UserId) -> String {
    if conversation.id.is_master() {
        return MASTER_CONVERSATION_NAME.to_string();
    }
    if let Some(name) = conversation.name.as_deref().filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }

    let others: Vec<&str> = participants
        .iter()
        .filter(|u| &u.id != viewer)
        .map(|u| u.username.as_str())
        .collect();
    if !others.is_empty() {
        return others.join(", ");
    }

    participants
        .iter()
        .find(|u| &u.id == viewer)
        .map(|u| u.username.clone())
        .unwrap_or_else(|| viewer.to_string())
}

fn load_view(
    db: &Database,
    conversation: Conversation,
    viewer: &UserId,
) -> huddle_store::Result<ConversationView> {
    let participants = db.get_users(&conversation.participants)?;
    let last_event = db.last_event(&conversation.id)?;
    Ok(ConversationView::build(
        conversation,
        participants,
        last_event,
        viewer,
    ))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct MembershipService {
    store: Store,
    broadcaster: Broadcaster,
    ledger: EventLedger,
}

impl MembershipService {
    pub fn new(store: Store, broadcaster: Broadcaster, ledger: EventLedger) -> Self {
        Self {
            store,
            broadcaster,
            ledger,
        }
    }

    /// Conversations `user_id` is in, newest activity first.
    pub async fn list_for_user(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ConversationView>, ChatError> {
        let viewer = user_id.clone();
        self.store
            .call(move |db| {
                db.conversations_for_user(&viewer, since)?
                    .into_iter()
                    .map(|conv| load_view(db, conv, &viewer))
                    .collect()
            })
            .await
    }

    pub async fn create(
        &self,
        creator_id: &UserId,
        participant_ids: Vec<UserId>,
        name: Option<String>,
        avatar: Option<String>,
        is_public: bool,
    ) -> Result<ConversationView, ChatError> {
        let mut members: BTreeSet<UserId> = participant_ids.into_iter().collect();
        members.insert(creator_id.clone());

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::generate(),
            name: non_blank(name),
            avatar: non_blank(avatar),
            created_by: Some(creator_id.clone()),
            is_public,
            participants: members.into_iter().collect(),
            created_at: now,
            updated_at: now,
        };

        let record = conversation.clone();
        let viewer = creator_id.clone();
        let view = self
            .store
            .call(move |db| {
                db.create_conversation(&record)?;
                load_view(db, record, &viewer)
            })
            .await?;

        info!(
            conversation = %conversation.id,
            creator = %creator_id,
            participants = conversation.participants.len(),
            "Conversation created"
        );

        self.broadcaster
            .notify_conversation(
                &conversation.id,
                notice::CONVERSATION_CREATED,
                json!({ "conversation": conversation }),
                std::slice::from_ref(creator_id),
            )
            .await;

        Ok(view)
    }

    /// Add users to an existing conversation. Any caller may invite.
    pub async fn invite(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
        participant_ids: Vec<UserId>,
    ) -> Result<Conversation, ChatError> {
        if participant_ids.is_empty() {
            return Err(ChatError::Validation("no participants given".into()));
        }

        let conv = conversation_id.clone();
        let (conversation, added) = self
            .store
            .call(move |db| {
                let added = if db.conversation_exists(&conv)? {
                    db.add_participants(&conv, &participant_ids)?
                } else {
                    0
                };
                Ok((db.get_conversation(&conv)?, added))
            })
            .await
            .map_err(not_found_as_conversation)?;

        info!(
            conversation = %conversation_id,
            actor = %actor_id,
            added,
            "Participants invited"
        );

        self.announce_update(&conversation, actor_id).await;
        Ok(conversation)
    }

    /// Join a public conversation.
    pub async fn join(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<Conversation, ChatError> {
        let conv = conversation_id.clone();
        let existing = self
            .store
            .call(move |db| db.get_conversation(&conv))
            .await
            .map_err(not_found_as_conversation)?;

        if !existing.is_public {
            return Err(ChatError::Authorization("conversation is not public".into()));
        }
        if existing.has_participant(user_id) {
            return Ok(existing);
        }

        let conv = conversation_id.clone();
        let joiner = user_id.clone();
        let added = self
            .store
            .call(move |db| db.add_participants(&conv, std::slice::from_ref(&joiner)))
            .await?;

        if added > 0 {
            info!(conversation = %conversation_id, user = %user_id, "User joined");
            match self.ledger.create_join(user_id, conversation_id).await {
                Ok(event) => {
                    self.ledger.announce(&event).await;
                }
                Err(e) => warn!(
                    conversation = %conversation_id,
                    user = %user_id,
                    error = %e,
                    "Failed to record JOIN event"
                ),
            }
        }

        let conversation = self.reload(conversation_id).await?;
        self.announce_update(&conversation, user_id).await;
        Ok(conversation)
    }

    /// Silently remove participants. Only the creator, while still a
    /// participant, may do this.
    pub async fn block(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
        target_ids: Vec<UserId>,
    ) -> Result<Conversation, ChatError> {
        let existing = self.reload(conversation_id).await?;
        if !existing.is_creator(actor_id) || !existing.has_participant(actor_id) {
            return Err(ChatError::Authorization(
                "only the conversation creator may block participants".into(),
            ));
        }

        let conv = conversation_id.clone();
        let removed = self
            .store
            .call(move |db| db.remove_participants(&conv, &target_ids))
            .await?;

        info!(
            conversation = %conversation_id,
            actor = %actor_id,
            removed,
            "Participants blocked"
        );

        let conversation = self.reload(conversation_id).await?;
        self.announce_update(&conversation, actor_id).await;
        Ok(conversation)
    }

    /// Leave a conversation. A visible leave writes the LEAVE event and the
    /// removal together; a hidden leave changes nothing but the participant
    /// set.
    pub async fn leave(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        hidden: bool,
    ) -> Result<(), ChatError> {
        require_participant(&self.store, conversation_id, user_id).await?;

        let leave_event = if hidden {
            let conv = conversation_id.clone();
            let leaver = user_id.clone();
            self.store
                .call(move |db| db.remove_participants(&conv, std::slice::from_ref(&leaver)))
                .await?;
            None
        } else {
            Some(self.ledger.create_leave(user_id, conversation_id).await?)
        };

        info!(conversation = %conversation_id, user = %user_id, hidden, "User left");

        if let Some(event) = leave_event {
            self.ledger.announce(&event).await;
            if let Ok(conversation) = self.reload(conversation_id).await {
                self.announce_update(&conversation, user_id).await;
            }
        }
        Ok(())
    }

    /// Replace the group name and avatar. Anyone but the creator is told the
    /// conversation does not exist.
    pub async fn update_details(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
        name: Option<String>,
        avatar: Option<String>,
    ) -> Result<Conversation, ChatError> {
        self.require_creator(conversation_id, actor_id).await?;

        let conv = conversation_id.clone();
        let name = non_blank(name);
        let avatar = non_blank(avatar);
        let conversation = self
            .store
            .call(move |db| {
                db.update_conversation_details(&conv, name.as_deref(), avatar.as_deref())?;
                db.get_conversation(&conv)
            })
            .await
            .map_err(not_found_as_conversation)?;

        info!(conversation = %conversation_id, actor = %actor_id, "Conversation details updated");
        self.announce_update(&conversation, actor_id).await;
        Ok(conversation)
    }

    pub async fn set_public(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
        is_public: bool,
    ) -> Result<Conversation, ChatError> {
        self.require_creator(conversation_id, actor_id).await?;

        let conv = conversation_id.clone();
        let conversation = self
            .store
            .call(move |db| {
                db.set_conversation_public(&conv, is_public)?;
                db.get_conversation(&conv)
            })
            .await
            .map_err(not_found_as_conversation)?;

        info!(
            conversation = %conversation_id,
            actor = %actor_id,
            is_public,
            "Conversation visibility changed"
        );
        self.announce_update(&conversation, actor_id).await;
        Ok(conversation)
    }

    async fn require_creator(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
    ) -> Result<(), ChatError> {
        let existing = self.reload(conversation_id).await?;
        if existing.is_creator(actor_id) {
            Ok(())
        } else {
            Err(ChatError::conversation_not_found())
        }
    }

    async fn reload(&self, conversation_id: &ConversationId) -> Result<Conversation, ChatError> {
        let conv = conversation_id.clone();
        self.store
            .call(move |db| db.get_conversation(&conv))
            .await
            .map_err(not_found_as_conversation)
    }

    async fn announce_update(&self, conversation: &Conversation, actor_id: &UserId) {
        self.broadcaster
            .notify_conversation(
                &conversation.id,
                notice::CONVERSATION_UPDATED,
                json!({ "conversation": conversation }),
                std::slice::from_ref(actor_id),
            )
            .await;
    }
}

fn not_found_as_conversation(e: ChatError) -> ChatError {
    match e {
        ChatError::NotFound(_) => ChatError::conversation_not_found(),
        other => other,
    }
}
