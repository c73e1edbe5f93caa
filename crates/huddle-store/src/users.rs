//! CRUD operations for [`User`] records.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use huddle_shared::UserId;

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{fmt_ts, parse_ts, User};

const USER_COLUMNS: &str =
    "id, username, name, avatar, color, public_key, last_seen, created_at";

impl Database {
    /// Insert or refresh a user after authentication.
    ///
    /// Profile fields and `last_seen` are overwritten; the stored public key
    /// is replaced only when `user.public_key` is set. Returns `true` when the
    /// record did not exist before.
    pub fn upsert_user(&self, user: &User) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO users
                 (id, username, name, avatar, color, public_key, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id.as_str(),
                user.username,
                user.name,
                user.avatar,
                user.color,
                user.public_key,
                fmt_ts(&user.last_seen),
                fmt_ts(&user.created_at),
            ],
        )? > 0;

        if !inserted {
            tx.execute(
                "UPDATE users
                 SET username = ?2, name = ?3, avatar = ?4, color = ?5,
                     public_key = COALESCE(?6, public_key), last_seen = ?7
                 WHERE id = ?1",
                params![
                    user.id.as_str(),
                    user.username,
                    user.name,
                    user.avatar,
                    user.color,
                    user.public_key,
                    fmt_ts(&user.last_seen),
                ],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Record directory entries (e.g. followings) without touching
    /// `last_seen` or key material of users already known.
    pub fn remember_users(&self, users: &[User]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO users
                     (id, username, name, avatar, color, public_key, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     username = excluded.username,
                     name = excluded.name,
                     avatar = excluded.avatar,
                     color = excluded.color",
            )?;
            for user in users {
                stmt.execute(params![
                    user.id.as_str(),
                    user.username,
                    user.name,
                    user.avatar,
                    user.color,
                    fmt_ts(&user.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn find_user(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .optional()?)
    }

    /// Fetch every known user among `ids`. Unknown ids are skipped.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE id IN (SELECT value FROM json_each(?1))
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![id_list(ids)], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Store the caller's public key and return the refreshed record.
    pub fn set_public_key(&self, id: &UserId, public_key: &str) -> Result<User> {
        let affected = self.conn().execute(
            "UPDATE users SET public_key = ?2 WHERE id = ?1",
            params![id.as_str(), public_key],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        self.get_user(id)
    }

    /// Stored public keys for the given users; users without a key are absent.
    pub fn public_keys(&self, ids: &[UserId]) -> Result<HashMap<UserId, String>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, public_key FROM users
             WHERE public_key IS NOT NULL AND id IN (SELECT value FROM json_each(?1))",
        )?;

        let rows = stmt.query_map(params![id_list(ids)], |row| {
            Ok((UserId(row.get(0)?), row.get::<_, String>(1)?))
        })?;

        let mut keys = HashMap::new();
        for row in rows {
            let (id, key) = row?;
            keys.insert(id, key);
        }
        Ok(keys)
    }
}

/// Encode ids as a JSON array for use with `json_each`.
pub(crate) fn id_list<T: serde::Serialize>(ids: &[T]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let last_seen: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        name: row.get(2)?,
        avatar: row.get(3)?,
        color: row.get(4)?,
        public_key: row.get(5)?,
        last_seen: parse_ts(6, &last_seen)?,
        created_at: parse_ts(7, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::user;
    use chrono::{Duration, Utc};

    #[test]
    fn upsert_reports_first_insert_only() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.upsert_user(&user("alice")).unwrap());
        assert!(!db.upsert_user(&user("alice")).unwrap());
    }

    #[test]
    fn upsert_keeps_public_key_when_profile_has_none() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&user("alice")).unwrap();
        db.set_public_key(&UserId::from("alice"), "pk-1").unwrap();

        let mut again = user("alice");
        again.username = "renamed".into();
        again.last_seen = Utc::now() + Duration::seconds(5);
        db.upsert_user(&again).unwrap();

        let stored = db.get_user(&UserId::from("alice")).unwrap();
        assert_eq!(stored.username, "renamed");
        assert_eq!(stored.public_key.as_deref(), Some("pk-1"));
    }

    #[test]
    fn remember_users_does_not_clobber_keys() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&user("bob")).unwrap();
        db.set_public_key(&UserId::from("bob"), "pk-bob").unwrap();

        db.remember_users(&[user("bob"), user("carol")]).unwrap();

        let keys = db
            .public_keys(&[UserId::from("bob"), UserId::from("carol")])
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[&UserId::from("bob")], "pk-bob");
        assert!(db.find_user(&UserId::from("carol")).unwrap().is_some());
    }

    #[test]
    fn get_users_skips_unknown() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&user("alice")).unwrap();
        let users = db
            .get_users(&[UserId::from("alice"), UserId::from("ghost")])
            .unwrap();
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_user(&UserId::from("ghost")),
            Err(crate::StoreError::NotFound)
        ));
        assert!(db.set_public_key(&UserId::from("ghost"), "k").is_err());
    }
}
