//! Event ledger and read markers.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use huddle_shared::types::EventKind;
use huddle_shared::{ConversationId, EventId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{fmt_ts, parse_ts, ChatEvent, UnreadCount};

const EVENT_COLUMNS: &str = "id, kind, owner_id, conversation_id, text, created_at";

impl Database {
    /// Append `event` provided its owner is a participant of its
    /// conversation at this moment. The check and the insert are one
    /// statement. Returns `false` (and writes nothing) otherwise.
    ///
    /// Entries in `event.read_by` are recorded as read markers.
    pub fn insert_event_if_participant(&self, event: &ChatEvent) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        if !insert_event(&tx, event)? {
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    /// Append the owner's LEAVE `event` and drop the owner from the
    /// conversation, both or neither. Returns `false` when the owner was not
    /// a participant.
    pub fn insert_leave_and_remove(&self, event: &ChatEvent) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        if !insert_event(&tx, event)? {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![event.conversation_id.as_str(), event.owner_id.as_str()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_event(&self, id: &EventId) -> Result<ChatEvent> {
        let mut event = self
            .conn()
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_event,
            )
            .map_err(not_found)?;
        event.read_by = self.readers(id)?;
        Ok(event)
    }

    /// A page of events, newest first.
    pub fn fetch_events(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatEvent>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_event,
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        for event in &mut events {
            event.read_by = self.readers(&event.id)?;
        }
        Ok(events)
    }

    pub fn last_event(&self, conversation_id: &ConversationId) -> Result<Option<ChatEvent>> {
        Ok(self.fetch_events(conversation_id, 1, 0)?.into_iter().next())
    }

    /// Users who have read `id`, sorted.
    pub fn readers(&self, id: &EventId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM event_reads WHERE event_id = ?1 ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map(params![id.0.to_string()], |row| Ok(UserId(row.get(0)?)))?;

        let mut readers = Vec::new();
        for row in rows {
            readers.push(row?);
        }
        Ok(readers)
    }

    /// Mark a single event read. Fails with `NotFound` if the event is not
    /// part of `conversation_id`; returns `false` if it was already read.
    pub fn mark_event_read(
        &self,
        conversation_id: &ConversationId,
        event_id: &EventId,
        user_id: &UserId,
    ) -> Result<bool> {
        let belongs: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM events WHERE id = ?1 AND conversation_id = ?2",
                params![event_id.0.to_string(), conversation_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if belongs.is_none() {
            return Err(crate::StoreError::NotFound);
        }

        let added = self.conn().execute(
            "INSERT OR IGNORE INTO event_reads (event_id, user_id, read_at) VALUES (?1, ?2, ?3)",
            params![event_id.0.to_string(), user_id.as_str(), fmt_ts(&Utc::now())],
        )?;
        Ok(added > 0)
    }

    /// Mark every event currently in the conversation read. Returns the
    /// number of newly recorded markers.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<usize> {
        let added = self.conn().execute(
            "INSERT OR IGNORE INTO event_reads (event_id, user_id, read_at)
             SELECT id, ?2, ?3 FROM events WHERE conversation_id = ?1",
            params![conversation_id.as_str(), user_id.as_str(), fmt_ts(&Utc::now())],
        )?;
        Ok(added)
    }

    /// Unread event counts for every conversation `user_id` currently
    /// participates in (zero counts included).
    pub fn unread_counts(&self, user_id: &UserId) -> Result<Vec<UnreadCount>> {
        let mut stmt = self.conn().prepare(
            "SELECT p.conversation_id,
                    (SELECT COUNT(*) FROM events e
                     WHERE e.conversation_id = p.conversation_id
                       AND NOT EXISTS (SELECT 1 FROM event_reads r
                                       WHERE r.event_id = e.id AND r.user_id = p.user_id))
             FROM conversation_participants p
             WHERE p.user_id = ?1
             ORDER BY p.conversation_id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], |row| {
            Ok(UnreadCount {
                conversation_id: ConversationId(row.get(0)?),
                unread_count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

/// Participant-guarded insert of `event`, its read markers and the
/// conversation's activity bump. Runs inside the caller's transaction.
fn insert_event(conn: &Connection, event: &ChatEvent) -> Result<bool> {
    let created_at = fmt_ts(&event.created_at);

    let inserted = conn.execute(
        "INSERT INTO events (id, kind, owner_id, conversation_id, text, created_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6
         WHERE EXISTS(SELECT 1 FROM conversation_participants
                      WHERE conversation_id = ?4 AND user_id = ?3)",
        params![
            event.id.0.to_string(),
            event.kind.as_str(),
            event.owner_id.as_str(),
            event.conversation_id.as_str(),
            event.text,
            created_at,
        ],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO event_reads (event_id, user_id, read_at) VALUES (?1, ?2, ?3)",
    )?;
    for reader in &event.read_by {
        stmt.execute(params![event.id.0.to_string(), reader.as_str(), created_at])?;
    }

    conn.execute(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        params![event.conversation_id.as_str(), created_at],
    )?;
    Ok(true)
}

/// Map a row to a [`ChatEvent`] with an empty read-set.
fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatEvent> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let created_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind = EventKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown event kind {kind_str}").into(),
        )
    })?;

    Ok(ChatEvent {
        id: EventId(id),
        kind,
        owner_id: UserId(row.get(2)?),
        conversation_id: ConversationId(row.get(3)?),
        text: row.get(4)?,
        created_at: parse_ts(5, &created_str)?,
        read_by: Vec::new(),
    })
}
