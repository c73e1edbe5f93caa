//! Client for the external identity and social-graph service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use huddle_shared::constants::SOCIAL_PAGE_SIZE;
use huddle_shared::UserId;
use huddle_store::User;

use crate::error::ChatError;

/// A user profile as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Profile {
    /// A fresh local record for this profile, stamped now.
    pub fn into_user(self) -> User {
        let now = Utc::now();
        User {
            id: self.id,
            username: self.username,
            name: self.name,
            avatar: self.avatar,
            color: self.color,
            public_key: self.public_key,
            last_seen: now,
            created_at: now,
        }
    }
}

/// 1-based page number; anything below 1 reads as the first page. Offsets
/// past `u32::MAX` clamp there, which reads as an empty page.
pub fn page_offset(page: Option<u32>) -> u32 {
    page.unwrap_or(1)
        .saturating_sub(1)
        .saturating_mul(SOCIAL_PAGE_SIZE)
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer credential to the profile it belongs to.
    async fn authenticate(&self, credential: &str) -> Result<Profile, ChatError>;

    /// One page of the users `user_id` follows.
    async fn get_followings(
        &self,
        user_id: &UserId,
        credential: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError>;

    async fn search(
        &self,
        user_id: &UserId,
        credential: &str,
        query: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RemoteUser {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    avatar: Option<RemoteAvatar>,
    #[serde(default)]
    color: Option<RemoteColor>,
}

#[derive(Debug, Deserialize)]
struct RemoteAvatar {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteColor {
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowingsPage {
    #[serde(default)]
    results: Vec<FollowingEntry>,
}

#[derive(Debug, Deserialize)]
struct FollowingEntry {
    #[serde(default)]
    following_user: Option<RemoteUser>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    user: SearchUsers,
}

#[derive(Debug, Deserialize)]
struct SearchUsers {
    #[serde(default)]
    results: Vec<RemoteUser>,
}

impl RemoteUser {
    /// Directory entries are keyed by `uuid`; `/me` may only carry `id`.
    fn into_profile(self) -> Option<Profile> {
        let id = match (self.uuid, &self.id) {
            (Some(uuid), _) if !uuid.is_empty() => uuid,
            (_, Value::String(s)) if !s.is_empty() => s.clone(),
            (_, Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        let username = self.username.filter(|u| !u.is_empty())?;

        Some(Profile {
            id: UserId(id),
            username,
            name: None,
            avatar: self.avatar.and_then(|a| a.url),
            color: self.color.and_then(|c| c.color),
            public_key: None,
        })
    }
}

pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("huddle-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatError::Dependency(format!("identity client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChatError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .query(query)
            .send()
            .await
            .map_err(|e| ChatError::Dependency(format!("identity request to {path}: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChatError::Dependency(format!(
                "identity service answered {} for {path}",
                resp.status()
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ChatError::Dependency(format!("identity response from {path}: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(&self, credential: &str) -> Result<Profile, ChatError> {
        if credential.trim().is_empty() {
            return Err(ChatError::AuthenticationFailed);
        }

        let me: RemoteUser = self
            .get_json("/api/users/me/", credential, &[])
            .await
            .map_err(|e| {
                warn!(error = ?e, "Identity lookup failed");
                ChatError::AuthenticationFailed
            })?;

        me.into_profile().ok_or(ChatError::AuthenticationFailed)
    }

    async fn get_followings(
        &self,
        user_id: &UserId,
        credential: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        let path = format!("/api/v1/users/{user_id}/followings/");
        let body: FollowingsPage = self
            .get_json(
                &path,
                credential,
                &[
                    ("limit", SOCIAL_PAGE_SIZE.to_string()),
                    ("offset", page_offset(page).to_string()),
                ],
            )
            .await?;

        let profiles: Vec<Profile> = body
            .results
            .into_iter()
            .filter_map(|entry| entry.following_user)
            .filter_map(RemoteUser::into_profile)
            .collect();
        debug!(user = %user_id, count = profiles.len(), "Fetched followings");
        Ok(profiles)
    }

    async fn search(
        &self,
        user_id: &UserId,
        credential: &str,
        query: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        let body: SearchPage = self
            .get_json(
                "/api/v1/search/",
                credential,
                &[
                    ("q", query.to_string()),
                    ("limit", SOCIAL_PAGE_SIZE.to_string()),
                    ("offset", page_offset(page).to_string()),
                ],
            )
            .await?;

        let profiles: Vec<Profile> = body
            .user
            .results
            .into_iter()
            .filter_map(RemoteUser::into_profile)
            .collect();
        debug!(user = %user_id, count = profiles.len(), "User search");
        Ok(profiles)
    }
}
