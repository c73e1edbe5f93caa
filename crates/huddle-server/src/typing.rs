//! Ephemeral typing signals. Nothing here is persisted.

use serde_json::json;

use huddle_shared::protocol::notice;
use huddle_shared::{ConversationId, UserId};

use crate::broadcast::Broadcaster;
use crate::error::ChatError;
use crate::ledger::require_participant;
use crate::store::Store;

#[derive(Clone)]
pub struct TypingNotifier {
    store: Store,
    broadcaster: Broadcaster,
}

impl TypingNotifier {
    pub fn new(store: Store, broadcaster: Broadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Relay a typing signal to every participant, the actor's own devices
    /// included.
    pub async fn notify_typing(
        &self,
        conversation_id: &ConversationId,
        actor_id: &UserId,
    ) -> Result<usize, ChatError> {
        require_participant(&self.store, conversation_id, actor_id).await?;

        self.broadcaster
            .emit_to_conversation(
                conversation_id,
                notice::TYPING,
                json!({
                    "conversationId": conversation_id,
                    "userId": actor_id,
                }),
                &[],
            )
            .await
    }
}
