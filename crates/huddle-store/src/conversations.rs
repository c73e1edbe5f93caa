//! CRUD operations for [`Conversation`] records and their participant sets.

use chrono::{DateTime, Utc};
use rusqlite::params;

use huddle_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{fmt_ts, parse_ts, Conversation};
use crate::users::id_list;

const CONVERSATION_COLUMNS: &str =
    "id, name, avatar, created_by, is_public, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation together with its participant set.
    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, name, avatar, created_by, is_public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id.as_str(),
                conversation.name,
                conversation.avatar,
                conversation.created_by.as_ref().map(UserId::as_str),
                conversation.is_public,
                fmt_ts(&conversation.created_at),
                fmt_ts(&conversation.updated_at),
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            let joined_at = fmt_ts(&conversation.created_at);
            for user_id in &conversation.participants {
                stmt.execute(params![conversation.id.as_str(), user_id.as_str(), joined_at])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Return the master conversation, creating it on first reference.
    pub fn ensure_master_conversation(&self) -> Result<Conversation> {
        let now = fmt_ts(&Utc::now());
        let created = self.conn().execute(
            "INSERT OR IGNORE INTO conversations (id, name, avatar, created_by, is_public, created_at, updated_at)
             VALUES (?1, NULL, NULL, NULL, 1, ?2, ?2)",
            params![ConversationId::master().as_str(), now],
        )?;
        if created > 0 {
            tracing::info!("created master conversation");
        }
        self.get_conversation(&ConversationId::master())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a conversation with its current participant set.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let mut conversation = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(not_found)?;
        conversation.participants = self.participants(id)?;
        Ok(conversation)
    }

    /// Current participant ids, sorted.
    pub fn participants(&self, id: &ConversationId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM conversation_participants
             WHERE conversation_id = ?1
             ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| Ok(UserId(row.get(0)?)))?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    pub fn conversation_exists(&self, id: &ConversationId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn is_participant(&self, id: &ConversationId, user_id: &UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conversation_participants
                           WHERE conversation_id = ?1 AND user_id = ?2)",
            params![id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Conversations `user_id` participates in, most recently updated first.
    /// With `since`, only those updated strictly after it.
    pub fn conversations_for_user(
        &self,
        user_id: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.avatar, c.created_by, c.is_public, c.created_at, c.updated_at
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 AND (?2 IS NULL OR c.updated_at > ?2)
             ORDER BY c.updated_at DESC, c.id ASC",
        )?;

        let rows = stmt.query_map(
            params![user_id.as_str(), since.as_ref().map(fmt_ts)],
            row_to_conversation,
        )?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        for conversation in &mut conversations {
            conversation.participants = self.participants(&conversation.id)?;
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Add participants, ignoring those already present. Returns how many
    /// were actually added.
    pub fn add_participants(&self, id: &ConversationId, user_ids: &[UserId]) -> Result<usize> {
        let now = fmt_ts(&Utc::now());
        let added = self.conn().execute(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
             SELECT ?1, value, ?3 FROM json_each(?2)",
            params![id.as_str(), id_list(user_ids), now],
        )?;
        if added > 0 {
            self.touch_conversation(id, Utc::now())?;
        }
        Ok(added)
    }

    /// Remove participants. Returns how many were actually removed.
    pub fn remove_participants(&self, id: &ConversationId, user_ids: &[UserId]) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id IN (SELECT value FROM json_each(?2))",
            params![id.as_str(), id_list(user_ids)],
        )?;
        if removed > 0 {
            self.touch_conversation(id, Utc::now())?;
        }
        Ok(removed)
    }

    /// Replace the group name and avatar.
    pub fn update_conversation_details(
        &self,
        id: &ConversationId,
        name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET name = ?2, avatar = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), name, avatar, fmt_ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_conversation_public(&self, id: &ConversationId, is_public: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET is_public = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), is_public, fmt_ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        Ok(())
    }

    /// Bump `updated_at`. Never moves it backwards.
    pub fn touch_conversation(&self, id: &ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
            params![id.as_str(), fmt_ts(&at)],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a row to a [`Conversation`] with an empty participant list.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let created_by: Option<String> = row.get(3)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        name: row.get(1)?,
        avatar: row.get(2)?,
        created_by: created_by.map(UserId),
        is_public: row.get(4)?,
        participants: Vec::new(),
        created_at: parse_ts(5, &created_str)?,
        updated_at: parse_ts(6, &updated_str)?,
    })
}
