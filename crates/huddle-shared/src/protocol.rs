//! JSON wire protocol spoken over each client WebSocket.
//!
//! Clients send [`InboundFrame`]s naming a request; the server answers with at
//! most one [`ServerFrame::Reply`] per request id and pushes unsolicited
//! [`ServerFrame::Push`] notices as other users act.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{ConversationId, EventId, UserId};

/// Push notice names.
pub mod notice {
    pub const CONVERSATION_CREATED: &str = "conversations:created";
    pub const CONVERSATION_UPDATED: &str = "conversations:updated";
    pub const EVENT_CREATED: &str = "events:created";
    pub const EVENT_READ: &str = "events:read";
    pub const TYPING: &str = "events:typing";
    pub const AUTHENTICATION_REQUIRED: &str = "authentication-required";
}

/// Inbound request names.
pub mod request {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const CONVERSATIONS_FETCH: &str = "conversations:fetch";
    pub const CONVERSATIONS_CREATE: &str = "conversations:create";
    pub const CONVERSATIONS_INVITE: &str = "conversations:invite";
    pub const CONVERSATIONS_BLOCK: &str = "conversations:block";
    pub const CONVERSATIONS_JOIN: &str = "conversations:join";
    pub const CONVERSATIONS_SET_PUBLIC: &str = "conversations:setPublic";
    pub const CONVERSATIONS_UPDATE_AVATAR: &str = "conversations:updateAvatar";
    pub const CONVERSATIONS_DELETE: &str = "conversations:delete";
    pub const EVENTS_NEW_MESSAGE: &str = "events:new_message";
    pub const EVENTS_FETCH: &str = "events:fetch";
    pub const EVENTS_GET_UNREAD_COUNT: &str = "events:get_unread_count";
    pub const EVENTS_MARK_READ: &str = "events:mark_read";
    pub const EVENTS_TYPING: &str = "events:typing";
    pub const USERS_GET_FOLLOWINGS: &str = "users:get_followings";
    pub const USERS_SEARCH: &str = "users:search";
    pub const USERS_UPDATE_KEY: &str = "users:update_key";
    pub const USERS_ADD_OTKS: &str = "users:add_otks";
    pub const USERS_REMOVE_OTKS: &str = "users:remove_otks";
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A raw request as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Correlation id. Requests without one receive no reply.
    #[serde(default)]
    pub id: Option<u64>,
    /// Request name, e.g. `events:new_message`.
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Decode a text frame, enforcing the frame size limit.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Everything the server ever writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Reply { id: u64, data: Value },
    Push { event: String, data: Value },
}

impl ServerFrame {
    pub fn push(event: &str, data: Value) -> Self {
        Self::Push {
            event: event.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Typed requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credentials {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConversations {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversation {
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// Shared shape of `conversations:invite` and `conversations:block`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChange {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPublic {
    pub conversation_id: ConversationId,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAvatar {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversation {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub text: String,
    /// Opaque client token echoed back in the reply.
    #[serde(default)]
    pub nonce: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEvents {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub skip: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub event_id: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchUsers {
    pub query: String,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKey {
    #[serde(alias = "public_key")]
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OneTimeKeys {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Authenticate(Credentials),
    FetchConversations(FetchConversations),
    CreateConversation(CreateConversation),
    Invite(ParticipantChange),
    Block(ParticipantChange),
    Join(ConversationRef),
    SetPublic(SetPublic),
    UpdateAvatar(UpdateAvatar),
    DeleteConversation(DeleteConversation),
    NewMessage(NewMessage),
    FetchEvents(FetchEvents),
    GetUnreadCount,
    MarkRead(MarkRead),
    Typing(ConversationRef),
    GetFollowings(Page),
    SearchUsers(SearchUsers),
    UpdateKey(UpdateKey),
    AddOneTimeKeys(OneTimeKeys),
    RemoveOneTimeKeys(OneTimeKeys),
}

impl ClientRequest {
    /// Decode the payload of a named request.
    pub fn parse(event: &str, data: &Value) -> Result<Self, ProtocolError> {
        use request::*;

        let request = match event {
            AUTHENTICATE => match data {
                // A bare string is accepted as the token itself.
                Value::String(token) => Self::Authenticate(Credentials {
                    token: token.clone(),
                }),
                other => Self::Authenticate(payload(event, other)?),
            },
            CONVERSATIONS_FETCH => Self::FetchConversations(payload(event, data)?),
            CONVERSATIONS_CREATE => Self::CreateConversation(payload(event, data)?),
            CONVERSATIONS_INVITE => Self::Invite(payload(event, data)?),
            CONVERSATIONS_BLOCK => Self::Block(payload(event, data)?),
            CONVERSATIONS_JOIN => Self::Join(payload(event, data)?),
            CONVERSATIONS_SET_PUBLIC => Self::SetPublic(payload(event, data)?),
            CONVERSATIONS_UPDATE_AVATAR => Self::UpdateAvatar(payload(event, data)?),
            CONVERSATIONS_DELETE => Self::DeleteConversation(payload(event, data)?),
            EVENTS_NEW_MESSAGE => Self::NewMessage(payload(event, data)?),
            EVENTS_FETCH => Self::FetchEvents(payload(event, data)?),
            EVENTS_GET_UNREAD_COUNT => Self::GetUnreadCount,
            EVENTS_MARK_READ => Self::MarkRead(payload(event, data)?),
            EVENTS_TYPING => Self::Typing(payload(event, data)?),
            USERS_GET_FOLLOWINGS => Self::GetFollowings(payload(event, data)?),
            USERS_SEARCH => Self::SearchUsers(payload(event, data)?),
            USERS_UPDATE_KEY => Self::UpdateKey(payload(event, data)?),
            USERS_ADD_OTKS => Self::AddOneTimeKeys(payload(event, data)?),
            USERS_REMOVE_OTKS => Self::RemoveOneTimeKeys(payload(event, data)?),
            other => return Err(ProtocolError::UnknownRequest(other.to_string())),
        };
        Ok(request)
    }
}

/// Deserialize a request payload; a missing payload reads as `{}`.
fn payload<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T, ProtocolError> {
    let data = match data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}
