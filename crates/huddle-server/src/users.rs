//! Local user records, social lookups and opaque key material.

use std::sync::Arc;

use tracing::info;

use huddle_shared::types::EventKind;
use huddle_shared::{ConversationId, UserId};
use huddle_store::User;

use crate::error::ChatError;
use crate::identity::{IdentityProvider, Profile};
use crate::ledger::{draft, EventLedger};
use crate::store::Store;

#[derive(Clone)]
pub struct UserService {
    store: Store,
    ledger: EventLedger,
    identity: Arc<dyn IdentityProvider>,
}

impl UserService {
    pub fn new(store: Store, ledger: EventLedger, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            ledger,
            identity,
        }
    }

    /// Resolve a credential through the identity provider and record the
    /// resulting profile locally.
    pub async fn authenticate(&self, credential: &str) -> Result<User, ChatError> {
        let profile = self.identity.authenticate(credential).await?;
        self.sign_in(profile).await
    }

    /// Upsert the profile. A user seen for the first time also joins the
    /// master conversation, with a JOIN event announced there.
    pub async fn sign_in(&self, profile: Profile) -> Result<User, ChatError> {
        let record = profile.into_user();
        let id = record.id.clone();
        let join = draft(EventKind::Join, &id, &ConversationId::master(), None);

        let (user, created, joined) = self
            .store
            .call(move |db| {
                let created = db.upsert_user(&record)?;
                let mut joined = None;
                if created {
                    let master = db.ensure_master_conversation()?;
                    db.add_participants(&master.id, std::slice::from_ref(&record.id))?;
                    if db.insert_event_if_participant(&join)? {
                        joined = Some(join);
                    }
                }
                Ok((db.get_user(&record.id)?, created, joined))
            })
            .await?;

        if created {
            info!(user = %id, username = %user.username, "New user registered");
        }
        if let Some(event) = joined {
            self.ledger.announce(&event).await;
        }
        Ok(user)
    }

    /// Users the caller follows, remembered locally and decorated with stored
    /// public keys (empty when none is known).
    pub async fn followings(
        &self,
        user_id: &UserId,
        credential: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        let profiles = self
            .identity
            .get_followings(user_id, credential, page)
            .await?;

        let users: Vec<User> = profiles.iter().cloned().map(Profile::into_user).collect();
        let ids: Vec<UserId> = profiles.iter().map(|p| p.id.clone()).collect();
        let keys = self
            .store
            .call(move |db| {
                db.remember_users(&users)?;
                db.public_keys(&ids)
            })
            .await?;

        Ok(profiles
            .into_iter()
            .map(|mut profile| {
                profile.public_key = Some(keys.get(&profile.id).cloned().unwrap_or_default());
                profile
            })
            .collect())
    }

    pub async fn search(
        &self,
        user_id: &UserId,
        credential: &str,
        query: &str,
        page: Option<u32>,
    ) -> Result<Vec<Profile>, ChatError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.identity
            .search(user_id, credential, query.trim(), page)
            .await
    }

    pub async fn update_key(&self, user_id: &UserId, public_key: &str) -> Result<User, ChatError> {
        let key = public_key.trim().to_string();
        if key.is_empty() {
            return Err(ChatError::Validation("public key is empty".into()));
        }

        let id = user_id.clone();
        let user = self
            .store
            .call(move |db| db.set_public_key(&id, &key))
            .await?;
        info!(user = %user_id, "Public key updated");
        Ok(user)
    }

    /// Store one-time tokens. Returns how many the caller now has.
    pub async fn add_one_time_keys(
        &self,
        user_id: &UserId,
        tokens: Vec<String>,
    ) -> Result<u64, ChatError> {
        let tokens = clean_tokens(tokens);
        let id = user_id.clone();
        self.store
            .call(move |db| {
                db.add_one_time_keys(&id, &tokens)?;
                db.count_one_time_keys(&id)
            })
            .await
    }

    /// Delete one-time tokens. Returns how many the caller has left.
    pub async fn remove_one_time_keys(
        &self,
        user_id: &UserId,
        tokens: Vec<String>,
    ) -> Result<u64, ChatError> {
        let tokens = clean_tokens(tokens);
        let id = user_id.clone();
        self.store
            .call(move |db| {
                db.remove_one_time_keys(&id, &tokens)?;
                db.count_one_time_keys(&id)
            })
            .await
    }
}

fn clean_tokens(tokens: Vec<String>) -> Vec<String> {
    tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
