//! # huddle-server
//!
//! Real-time group messaging backend.
//!
//! Clients hold one WebSocket per device. Each socket must authenticate
//! against the external identity provider before anything else is accepted;
//! afterwards its requests are routed to:
//! - **Membership** -- conversation lifecycle and participant sets
//! - **Ledger** -- append-only conversation events, read markers, unread counts
//! - **Typing** -- ephemeral typing signals
//! - **Users** -- social lookups and opaque key material
//!
//! Every mutation that concerns other users fans out through the
//! [`broadcast::Broadcaster`], which looks up live connections in the
//! [`registry::SessionRegistry`].

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod membership;
pub mod registry;
pub mod state;
pub mod store;
pub mod typing;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;
