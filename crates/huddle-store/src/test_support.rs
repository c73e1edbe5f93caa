use chrono::Utc;

use huddle_shared::UserId;

use crate::models::User;

pub(crate) fn user(id: &str) -> User {
    User {
        id: UserId::from(id),
        username: format!("{id}-name"),
        name: None,
        avatar: None,
        color: Some("#ff0000".into()),
        public_key: None,
        last_seen: Utc::now(),
        created_at: Utc::now(),
    }
}

pub(crate) fn ids(raw: &[&str]) -> Vec<UserId> {
    raw.iter().map(|s| UserId::from(*s)).collect()
}
