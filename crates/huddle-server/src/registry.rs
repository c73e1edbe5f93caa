use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use huddle_shared::protocol::ServerFrame;
use huddle_shared::{ConnectionId, UserId};

use crate::error::ChatError;

/// Sending half of one live client connection.
///
/// Cloning is cheap; every clone feeds the same bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }

    /// A handle together with the receiver its writer task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting. A full or closed queue drops it.
    pub fn deliver(&self, frame: ServerFrame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(conn = %self.id.0, "Dropping frame for slow connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub users: usize,
    pub connections: usize,
}

#[derive(Default)]
struct Inner {
    by_user: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    owners: HashMap<ConnectionId, UserId>,
    stopped: bool,
}

/// Which live connections belong to which authenticated user.
///
/// A connection is associated with at most one user. A user with no live
/// connections has no entry at all.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `conn` with `user_id`, dropping any association the
    /// connection had before.
    pub async fn add_connection(
        &self,
        user_id: &UserId,
        conn: ConnectionHandle,
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.write().await;
        if inner.stopped {
            return Err(ChatError::Dependency("session registry is shut down".into()));
        }

        let conn_id = conn.id();
        if let Some(previous) = inner.owners.remove(&conn_id) {
            detach(&mut inner, &previous, &conn_id);
        }

        inner
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(conn_id, conn);
        inner.owners.insert(conn_id, user_id.clone());

        info!(
            user = %user_id,
            conn = %conn_id.0,
            devices = inner.by_user.get(user_id).map(HashMap::len).unwrap_or(0),
            "Connection registered"
        );
        Ok(())
    }

    /// Every live connection of `user_id`; empty if none.
    pub async fn get_connections(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop `conn_id` wherever it is registered. No-op when unknown.
    pub async fn remove_connection(&self, conn_id: ConnectionId) -> Option<UserId> {
        let mut inner = self.inner.write().await;
        let user_id = inner.owners.remove(&conn_id)?;
        detach(&mut inner, &user_id, &conn_id);
        info!(user = %user_id, conn = %conn_id.0, "Connection removed");
        Some(user_id)
    }

    pub async fn user_of(&self, conn_id: ConnectionId) -> Option<UserId> {
        self.inner.read().await.owners.get(&conn_id).cloned()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            users: inner.by_user.len(),
            connections: inner.owners.len(),
        }
    }

    /// Forget every connection and refuse new ones. Returns how many were
    /// dropped.
    pub async fn shutdown(&self) -> usize {
        let mut inner = self.inner.write().await;
        inner.stopped = true;
        let dropped = inner.owners.len();
        inner.owners.clear();
        inner.by_user.clear();
        info!(dropped, "Session registry shut down");
        dropped
    }
}

fn detach(inner: &mut Inner, user_id: &UserId, conn_id: &ConnectionId) {
    let now_empty = match inner.by_user.get_mut(user_id) {
        Some(conns) => {
            conns.remove(conn_id);
            conns.is_empty()
        }
        None => false,
    };
    if now_empty {
        inner.by_user.remove(user_id);
    }
}
