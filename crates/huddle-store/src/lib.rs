//! # huddle-store
//!
//! Durable storage for the Huddle chat server, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users,
//! conversations, the event ledger and read markers. Each helper is a single
//! statement or a single transaction; nothing here spans calls.

pub mod conversations;
pub mod database;
pub mod events;
pub mod migrations;
pub mod models;
pub mod one_time_keys;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;

#[cfg(test)]
pub(crate) mod test_support;
