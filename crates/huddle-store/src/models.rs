//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so the server can hand it straight to
//! clients; field names are camelCase on the wire.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use huddle_shared::types::EventKind;
use huddle_shared::{ConversationId, EventId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user known to this server. Created or refreshed on authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<String>,
    /// Opaque public key material for the client-side encryption scheme.
    pub public_key: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// Group name, if one was set.
    pub name: Option<String>,
    pub avatar: Option<String>,
    /// `None` only for the master conversation.
    pub created_by: Option<UserId>,
    pub is_public: bool,
    /// Current participant set, sorted by id.
    pub participants: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    pub fn is_creator(&self, user_id: &UserId) -> bool {
        self.created_by.as_ref() == Some(user_id)
    }
}

// ---------------------------------------------------------------------------
// Chat event
// ---------------------------------------------------------------------------

/// An immutable ledger entry. Only `read_by` changes after creation, and it
/// only grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub owner_id: UserId,
    pub conversation_id: ConversationId,
    /// Present for MESSAGE events only.
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_by: Vec<UserId>,
}

impl ChatEvent {
    pub fn new(
        kind: EventKind,
        owner_id: UserId,
        conversation_id: ConversationId,
        text: Option<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            kind,
            owner_id,
            conversation_id,
            text,
            created_at: Utc::now(),
            read_by: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unread statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub conversation_id: ConversationId,
    pub unread_count: u64,
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC-3339 so that text comparison orders like time.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
