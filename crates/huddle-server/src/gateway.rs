//! Per-connection authentication gate and request routing.
//!
//! A connection starts `Unauthenticated` and only `authenticate` is
//! accepted until it succeeds. Authenticated requests run as independent
//! tasks so one slow request never holds up the rest of the socket.
//!
//! `authenticate` may be repeated. A successful repeat moves the connection
//! to the new user; a failed one leaves the existing association and state
//! untouched.

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_shared::protocol::{notice, request, ClientRequest, InboundFrame, ServerFrame};
use huddle_shared::UserId;

use crate::error::ChatError;
use crate::registry::ConnectionHandle;
use crate::state::AppState;

/// Who an authenticated connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    /// Bearer credential presented at authentication, reused for provider
    /// lookups made on the user's behalf.
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated(AuthContext),
    Closed,
}

/// The reply capability bound to one inbound request. Consumed on use, so
/// a request is answered at most once; requests without an id are never
/// answered.
pub struct Responder {
    id: Option<u64>,
    conn: ConnectionHandle,
}

impl Responder {
    pub fn new(id: Option<u64>, conn: ConnectionHandle) -> Self {
        Self { id, conn }
    }

    pub fn respond(self, data: Value) -> bool {
        match self.id {
            Some(id) => self.conn.deliver(ServerFrame::Reply { id, data }),
            None => false,
        }
    }

    /// Reply `{success: true, ..fields}`.
    pub fn succeed(self, fields: Value) -> bool {
        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(true));
        if let Value::Object(extra) = fields {
            body.extend(extra);
        }
        self.respond(Value::Object(body))
    }

    /// Reply with the failure envelope, plus any `extra` fields.
    pub fn fail(self, err: &ChatError, extra: Value) -> bool {
        let mut body = err.envelope();
        if let (Value::Object(body), Value::Object(extra)) = (&mut body, extra) {
            body.extend(extra);
        }
        self.respond(body)
    }
}

pub struct ConnectionSession {
    app: AppState,
    conn: ConnectionHandle,
    state: ConnectionState,
}

impl ConnectionSession {
    pub fn new(app: AppState, conn: ConnectionHandle) -> Self {
        debug!(conn = %conn.id().0, "Connection opened");
        Self {
            app,
            conn,
            state: ConnectionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Route one inbound frame. Returns the task running the request when
    /// it was handed off.
    pub async fn handle_frame(&mut self, frame: InboundFrame) -> Option<JoinHandle<()>> {
        let responder = Responder::new(frame.id, self.conn.clone());

        let ctx = match &self.state {
            ConnectionState::Closed => return None,
            ConnectionState::Unauthenticated if frame.event != request::AUTHENTICATE => {
                debug!(
                    conn = %self.conn.id().0,
                    event = %frame.event,
                    "Rejected request before authentication"
                );
                self.conn.deliver(ServerFrame::push(
                    notice::AUTHENTICATION_REQUIRED,
                    json!({ "event": frame.event, "data": frame.data }),
                ));
                responder.fail(&ChatError::AuthenticationRequired, Value::Null);
                return None;
            }
            ConnectionState::Unauthenticated => None,
            ConnectionState::Authenticated(ctx) => Some(ctx.clone()),
        };

        let request = match ClientRequest::parse(&frame.event, &frame.data) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = %self.conn.id().0, event = %frame.event, error = %e, "Bad request");
                responder.fail(&ChatError::from(e), Value::Null);
                return None;
            }
        };

        if let ClientRequest::Authenticate(credentials) = request {
            self.authenticate(credentials.token, responder).await;
            return None;
        }

        let ctx = ctx?;
        let app = self.app.clone();
        Some(tokio::spawn(dispatch(app, ctx, frame.event, request, responder)))
    }

    /// On failure the connection keeps whatever state it already had.
    async fn authenticate(&mut self, credential: String, responder: Responder) {
        let user = match self.app.users.authenticate(&credential).await {
            Ok(user) => user,
            Err(e) => {
                warn!(conn = %self.conn.id().0, error = %e, "Authentication failed");
                responder.fail(&ChatError::AuthenticationFailed, Value::Null);
                return;
            }
        };

        if let Err(e) = self
            .app
            .registry
            .add_connection(&user.id, self.conn.clone())
            .await
        {
            warn!(conn = %self.conn.id().0, error = %e, "Could not register connection");
            responder.fail(&ChatError::AuthenticationFailed, Value::Null);
            return;
        }

        info!(conn = %self.conn.id().0, user = %user.id, "Connection authenticated");
        self.state = ConnectionState::Authenticated(AuthContext {
            user_id: user.id.clone(),
            credential,
        });
        responder.succeed(json!({ "user": user }));
    }

    /// Terminal. Deregisters the connection whether or not it ever
    /// authenticated.
    pub async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        let owner = self.app.registry.remove_connection(self.conn.id()).await;
        debug!(conn = %self.conn.id().0, user = ?owner, "Connection closed");
    }
}

/// Run one authenticated request and answer it.
async fn dispatch(
    app: AppState,
    ctx: AuthContext,
    event: String,
    request: ClientRequest,
    responder: Responder,
) {
    let user = &ctx.user_id;

    // Message creation echoes the client nonce on both outcomes and
    // announces the event only after the sender has its reply.
    if let ClientRequest::NewMessage(msg) = request {
        let nonce = msg.nonce.unwrap_or(Value::Null);
        match app
            .ledger
            .create_message(user, &msg.conversation_id, &msg.text)
            .await
        {
            Ok(created) => {
                responder.succeed(json!({ "event": created, "nonce": nonce }));
                app.ledger.announce(&created).await;
            }
            Err(e) => {
                warn!(user = %user, event = %event, error = %e, "Request failed");
                responder.fail(&e, json!({ "nonce": nonce }));
            }
        }
        return;
    }

    let result = match request {
        ClientRequest::FetchConversations(req) => app
            .membership
            .list_for_user(user, req.since)
            .await
            .map(|conversations| json!({ "conversations": conversations })),
        ClientRequest::CreateConversation(req) => app
            .membership
            .create(
                user,
                req.participant_ids,
                req.name,
                req.avatar,
                req.is_public.unwrap_or(false),
            )
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::Invite(req) => app
            .membership
            .invite(&req.conversation_id, user, req.participant_ids)
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::Block(req) => app
            .membership
            .block(&req.conversation_id, user, req.participant_ids)
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::Join(req) => app
            .membership
            .join(&req.conversation_id, user)
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::SetPublic(req) => app
            .membership
            .set_public(&req.conversation_id, user, req.is_public)
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::UpdateAvatar(req) => app
            .membership
            .update_details(&req.conversation_id, user, req.name, req.avatar)
            .await
            .map(|conversation| json!({ "conversation": conversation })),
        ClientRequest::DeleteConversation(req) => app
            .membership
            .leave(&req.conversation_id, user, req.hidden)
            .await
            .map(|()| json!({})),
        ClientRequest::FetchEvents(req) => app
            .ledger
            .fetch(user, &req.conversation_id, req.skip.unwrap_or(0), None)
            .await
            .map(|events| json!({ "events": events })),
        ClientRequest::GetUnreadCount => app
            .ledger
            .unread_stats(user)
            .await
            .map(|(counts, total)| json!({ "conversations": counts, "total": total })),
        ClientRequest::MarkRead(req) => app
            .ledger
            .mark_read(user, &req.conversation_id, req.event_id)
            .await
            .map(|_| json!({})),
        ClientRequest::Typing(req) => app
            .typing
            .notify_typing(&req.conversation_id, user)
            .await
            .map(|_| json!({})),
        ClientRequest::GetFollowings(req) => app
            .users
            .followings(user, &ctx.credential, req.page)
            .await
            .map(|followings| json!({ "followings": followings })),
        ClientRequest::SearchUsers(req) => app
            .users
            .search(user, &ctx.credential, &req.query, req.page)
            .await
            .map(|results| json!({ "results": results })),
        ClientRequest::UpdateKey(req) => app
            .users
            .update_key(user, &req.public_key)
            .await
            .map(|user| json!({ "user": user })),
        ClientRequest::AddOneTimeKeys(req) => app
            .users
            .add_one_time_keys(user, req.tokens)
            .await
            .map(|count| json!({ "count": count })),
        ClientRequest::RemoveOneTimeKeys(req) => app
            .users
            .remove_one_time_keys(user, req.tokens)
            .await
            .map(|count| json!({ "count": count })),
        ClientRequest::Authenticate(_) | ClientRequest::NewMessage(_) => {
            Err(ChatError::Validation(format!("{event} cannot be dispatched")))
        }
    };

    match result {
        Ok(fields) => {
            debug!(user = %user, event = %event, "Request handled");
            responder.succeed(fields);
        }
        Err(e) => {
            warn!(user = %user, event = %event, error = %e, "Request failed");
            responder.fail(&e, Value::Null);
        }
    }
}
