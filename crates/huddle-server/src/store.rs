//! Async handle over the synchronous [`Database`].
//!
//! Each call locks the database for exactly one store operation and runs it
//! on the blocking pool. Multi-step service logic is therefore not atomic:
//! concurrent membership edits on one conversation are last-writer-wins at
//! row granularity.

use std::sync::{Arc, Mutex};

use huddle_store::Database;

use crate::error::ChatError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> huddle_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| ChatError::Dependency("database mutex poisoned".into()))?;
            f(&*guard).map_err(ChatError::from)
        })
        .await
        .map_err(|e| ChatError::Dependency(format!("store task failed: {e}")))?
    }
}
