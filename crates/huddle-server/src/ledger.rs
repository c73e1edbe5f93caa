//! Append-only conversation events, read markers and unread counts.

use serde_json::json;
use tracing::{debug, info};

use huddle_shared::constants::{EVENT_PAGE_SIZE, MAX_MESSAGE_CHARS};
use huddle_shared::protocol::notice;
use huddle_shared::types::EventKind;
use huddle_shared::{ConversationId, EventId, UserId};
use huddle_store::{ChatEvent, Database, StoreError, UnreadCount};

use crate::broadcast::Broadcaster;
use crate::error::ChatError;
use crate::store::Store;

#[derive(Clone)]
pub struct EventLedger {
    store: Store,
    broadcaster: Broadcaster,
}

impl EventLedger {
    pub fn new(store: Store, broadcaster: Broadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Persist a MESSAGE from `owner_id`, already read by its owner.
    ///
    /// The event is not announced; call [`announce`](Self::announce) once the
    /// sender has been answered.
    pub async fn create_message(
        &self,
        owner_id: &UserId,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<ChatEvent, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message text is empty".into()));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::Validation(format!(
                "message text exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        self.append(
            EventKind::Message,
            owner_id,
            conversation_id,
            Some(text.to_string()),
        )
        .await
    }

    pub async fn create_join(
        &self,
        owner_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<ChatEvent, ChatError> {
        self.append(EventKind::Join, owner_id, conversation_id, None).await
    }

    /// Append the owner's LEAVE and drop them from the participant set in
    /// the same write.
    pub async fn create_leave(
        &self,
        owner_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<ChatEvent, ChatError> {
        self.append_with(
            EventKind::Leave,
            owner_id,
            conversation_id,
            None,
            Database::insert_leave_and_remove,
        )
        .await
    }

    async fn append(
        &self,
        kind: EventKind,
        owner_id: &UserId,
        conversation_id: &ConversationId,
        text: Option<String>,
    ) -> Result<ChatEvent, ChatError> {
        self.append_with(
            kind,
            owner_id,
            conversation_id,
            text,
            Database::insert_event_if_participant,
        )
        .await
    }

    async fn append_with(
        &self,
        kind: EventKind,
        owner_id: &UserId,
        conversation_id: &ConversationId,
        text: Option<String>,
        insert: fn(&Database, &ChatEvent) -> huddle_store::Result<bool>,
    ) -> Result<ChatEvent, ChatError> {
        let event = draft(kind, owner_id, conversation_id, text);

        let candidate = event.clone();
        let (exists, inserted) = self
            .store
            .call(move |db| {
                if !db.conversation_exists(&candidate.conversation_id)? {
                    return Ok((false, false));
                }
                Ok((true, insert(db, &candidate)?))
            })
            .await?;

        if !exists {
            return Err(ChatError::conversation_not_found());
        }
        if !inserted {
            return Err(ChatError::not_participant());
        }

        info!(
            event = %event.id,
            kind = event.kind.as_str(),
            owner = %owner_id,
            conversation = %conversation_id,
            "Event appended"
        );
        Ok(event)
    }

    /// Push `events:created` to every current participant, the owner's
    /// devices included.
    pub async fn announce(&self, event: &ChatEvent) -> usize {
        self.broadcaster
            .notify_conversation(
                &event.conversation_id,
                notice::EVENT_CREATED,
                json!({ "event": event }),
                &[],
            )
            .await
    }

    /// A page of events, newest first. `viewer` must be a current
    /// participant, so history is closed to anyone who has left.
    pub async fn fetch(
        &self,
        viewer: &UserId,
        conversation_id: &ConversationId,
        skip: u32,
        limit: Option<u32>,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        require_participant(&self.store, conversation_id, viewer).await?;

        let conv = conversation_id.clone();
        let limit = limit.unwrap_or(EVENT_PAGE_SIZE);
        self.store
            .call(move |db| db.fetch_events(&conv, limit, skip))
            .await
    }

    /// Mark one event, or every event in the conversation, read by `user_id`,
    /// then tell the other participants.
    pub async fn mark_read(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        event_id: Option<EventId>,
    ) -> Result<usize, ChatError> {
        require_participant(&self.store, conversation_id, user_id).await?;

        let conv = conversation_id.clone();
        let user = user_id.clone();
        let marked = self
            .store
            .call(move |db| match event_id {
                Some(id) => db.mark_event_read(&conv, &id, &user).map(usize::from),
                None => db.mark_conversation_read(&conv, &user),
            })
            .await
            .map_err(|e| match (e, event_id) {
                (ChatError::NotFound(_), Some(_)) => ChatError::NotFound("event".into()),
                (other, _) => other,
            })?;

        debug!(
            user = %user_id,
            conversation = %conversation_id,
            marked,
            "Marked read"
        );

        let mut payload = json!({
            "conversationId": conversation_id,
            "userId": user_id,
        });
        if let Some(id) = event_id {
            payload["eventId"] = json!(id);
        }
        self.broadcaster
            .notify_conversation(
                conversation_id,
                notice::EVENT_READ,
                payload,
                std::slice::from_ref(user_id),
            )
            .await;

        Ok(marked)
    }

    /// Unread counts over the conversations `user_id` currently belongs to,
    /// with their sum.
    pub async fn unread_stats(&self, user_id: &UserId) -> Result<(Vec<UnreadCount>, u64), ChatError> {
        let user = user_id.clone();
        let counts = self.store.call(move |db| db.unread_counts(&user)).await?;
        let total = counts.iter().map(|c| c.unread_count).sum();
        Ok((counts, total))
    }
}

/// A new event, already read by its owner.
pub(crate) fn draft(
    kind: EventKind,
    owner_id: &UserId,
    conversation_id: &ConversationId,
    text: Option<String>,
) -> ChatEvent {
    let mut event = ChatEvent::new(kind, owner_id.clone(), conversation_id.clone(), text);
    event.read_by.push(owner_id.clone());
    event
}

/// Fail with `NotFound` for an unknown conversation and `Authorization`
/// when `user_id` is not currently in it.
pub(crate) async fn require_participant(
    store: &Store,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<(), ChatError> {
    let conv = conversation_id.clone();
    let user = user_id.clone();
    let (exists, member) = store
        .call(move |db| {
            if !db.conversation_exists(&conv)? {
                return Ok::<_, StoreError>((false, false));
            }
            Ok((true, db.is_participant(&conv, &user)?))
        })
        .await?;

    match (exists, member) {
        (false, _) => Err(ChatError::conversation_not_found()),
        (true, false) => Err(ChatError::not_participant()),
        (true, true) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use crate::test_support::{drain, seed_conversation, TestApp};
    use huddle_shared::protocol::ServerFrame;

    #[tokio::test]
    async fn test_message_is_self_read_and_counted_for_others() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice", "bob"]).await;
        let ledger = &app.state.ledger;

        let event = ledger
            .create_message(&UserId::from("alice"), &conv, "hi")
            .await
            .unwrap();
        assert_eq!(event.read_by, vec![UserId::from("alice")]);

        let (bob_counts, total) = ledger.unread_stats(&UserId::from("bob")).await.unwrap();
        assert_eq!(bob_counts.len(), 1);
        assert_eq!(total, 1);
        let (_, alice_total) = ledger.unread_stats(&UserId::from("alice")).await.unwrap();
        assert_eq!(alice_total, 0);
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice"]).await;
        let err = app
            .state
            .ledger
            .create_message(&UserId::from("alice"), &conv, "   \n")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_conversation_and_outsider() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice"]).await;
        let ledger = &app.state.ledger;

        let missing = ledger
            .create_message(&UserId::from("alice"), &ConversationId::generate(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(missing, ChatError::NotFound(_)));

        let outsider = ledger
            .create_message(&UserId::from("mallory"), &conv, "hi")
            .await
            .unwrap_err();
        assert!(matches!(outsider, ChatError::Authorization(_)));
        assert!(ledger
            .fetch(&UserId::from("alice"), &conv, 0, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent_and_notifies_others() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice", "bob"]).await;
        let ledger = &app.state.ledger;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let (alice_conn, mut alice_rx) = ConnectionHandle::channel(8);
        let (bob_conn, mut bob_rx) = ConnectionHandle::channel(8);
        app.state.registry.add_connection(&alice, alice_conn).await.unwrap();
        app.state.registry.add_connection(&bob, bob_conn).await.unwrap();

        let event = ledger.create_message(&alice, &conv, "hi").await.unwrap();

        assert_eq!(ledger.mark_read(&bob, &conv, Some(event.id)).await.unwrap(), 1);
        assert_eq!(ledger.mark_read(&bob, &conv, Some(event.id)).await.unwrap(), 0);
        assert_eq!(ledger.mark_read(&bob, &conv, None).await.unwrap(), 0);
        assert_eq!(ledger.unread_stats(&bob).await.unwrap().1, 0);

        let pushes = drain(&mut alice_rx);
        assert_eq!(pushes.len(), 3);
        match &pushes[0] {
            ServerFrame::Push { event: name, data } => {
                assert_eq!(name, notice::EVENT_READ);
                assert_eq!(data["userId"], "bob");
                assert_eq!(data["eventId"], json!(event.id));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_unknown_event() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice"]).await;
        let err = app
            .state
            .ledger
            .mark_read(&UserId::from("alice"), &conv, Some(EventId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(what) if what == "event"));
    }

    #[tokio::test]
    async fn test_fetch_pages_newest_first() {
        let app = TestApp::new();
        let conv = seed_conversation(&app.state.store, "alice", &["alice"]).await;
        let ledger = &app.state.ledger;
        let alice = UserId::from("alice");
        for i in 0..25 {
            ledger
                .create_message(&alice, &conv, &format!("m{i}"))
                .await
                .unwrap();
        }

        let first = ledger.fetch(&alice, &conv, 0, None).await.unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first[0].text.as_deref(), Some("m24"));

        let second = ledger.fetch(&alice, &conv, 20, None).await.unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[4].text.as_deref(), Some("m0"));

        let outsider = ledger
            .fetch(&UserId::from("mallory"), &conv, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(outsider, ChatError::Authorization(_)));
    }
}
