//! Opaque one-time key tokens. The store never interprets them.

use chrono::Utc;
use rusqlite::params;

use huddle_shared::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::fmt_ts;
use crate::users::id_list;

impl Database {
    /// Store tokens for `user_id`, ignoring ones already stored. Returns how
    /// many were new.
    pub fn add_one_time_keys(&self, user_id: &UserId, tokens: &[String]) -> Result<usize> {
        let added = self.conn().execute(
            "INSERT OR IGNORE INTO user_one_time_keys (user_id, token, created_at)
             SELECT ?1, value, ?3 FROM json_each(?2)",
            params![user_id.as_str(), id_list(tokens), fmt_ts(&Utc::now())],
        )?;
        Ok(added)
    }

    pub fn remove_one_time_keys(&self, user_id: &UserId, tokens: &[String]) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM user_one_time_keys
             WHERE user_id = ?1 AND token IN (SELECT value FROM json_each(?2))",
            params![user_id.as_str(), id_list(tokens)],
        )?;
        Ok(removed)
    }

    pub fn count_one_time_keys(&self, user_id: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM user_one_time_keys WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
