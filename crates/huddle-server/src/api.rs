use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use huddle_shared::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use huddle_shared::protocol::InboundFrame;

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::gateway::ConnectionSession;
use crate::registry::{ConnectionHandle, RegistryStats};
use crate::state::{AppState, SocketSlot};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/admin/status", get(admin_status))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    connections: usize,
    users: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    open_sockets: usize,
    max_connections: usize,
    registry: RegistryStats,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    let stats = state.registry.stats().await;
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        connections: stats.connections,
        users: stats.users,
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ChatError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ChatError::Authorization(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ChatError::Authorization("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ChatError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        open_sockets: state.open_sockets(),
        max_connections: state.config.max_connections,
        registry: state.registry.stats().await,
    }))
}

// ─── WebSocket transport ───

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(slot) = state.try_open_socket() else {
        warn!(
            max = state.config.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
}

/// Pump one socket: a writer task drains the connection's outbound queue
/// while this task reads frames and hands them to the gateway.
async fn handle_socket(socket: WebSocket, state: AppState, _slot: SocketSlot) {
    let (conn, mut outbound) = ConnectionHandle::channel(state.config.outbound_buffer);
    let conn_id = conn.id();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = %conn_id.0, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = ConnectionSession::new(state, conn);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match InboundFrame::decode(&text) {
                Ok(frame) => {
                    session.handle_frame(frame).await;
                }
                Err(e) => {
                    warn!(conn = %conn_id.0, error = %e, "Dropping malformed frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn_id.0, error = %e, "Socket error");
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
}

/// Run the HTTP server until `shutdown` resolves.
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestApp;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str, auth: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = auth {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new();
        let (status, body) = get_json(build_router(app.state), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_info_reports_registry() {
        let app = TestApp::new();
        let (conn, _rx) = ConnectionHandle::channel(4);
        app.state
            .registry
            .add_connection(&huddle_shared::UserId::from("alice"), conn)
            .await
            .unwrap();

        let (status, body) = get_json(build_router(app.state), "/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Huddle");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["users"], 1);
    }

    #[tokio::test]
    async fn test_admin_status_requires_token() {
        let app = TestApp::with_config(ServerConfig {
            admin_token: Some("s3cret".into()),
            ..ServerConfig::default()
        });

        let (status, _) = get_json(build_router(app.state.clone()), "/admin/status", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) =
            get_json(build_router(app.state.clone()), "/admin/status", Some("nope")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            get_json(build_router(app.state), "/admin/status", Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registry"]["connections"], 0);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let app = TestApp::new();
        let (status, body) =
            get_json(build_router(app.state), "/admin/status", Some("anything")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }
}
