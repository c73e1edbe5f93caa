use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle_server::api;
use huddle_server::config::ServerConfig;
use huddle_server::identity::HttpIdentityProvider;
use huddle_server::state::AppState;
use huddle_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug")),
        )
        .init();

    info!("Starting Huddle chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        admin_enabled = config.admin_token.is_some(),
        max_connections = config.max_connections,
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = if config.is_ephemeral() {
        info!("Using in-memory database; nothing will persist");
        Database::open_in_memory()?
    } else {
        Database::open_at(&config.database_path)?
    };

    let identity = Arc::new(HttpIdentityProvider::new(
        &config.identity_base_url,
        config.identity_timeout,
    )?);

    let http_addr = config.http_addr;
    let state = AppState::new(config, db, identity);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic registry statistics (every 5 minutes)
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let stats = registry.stats().await;
            info!(
                users = stats.users,
                connections = stats.connections,
                "Session registry"
            );
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server until Ctrl+C
    // -----------------------------------------------------------------------
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let result = api::serve(state.clone(), http_addr, shutdown).await;
    state.registry.shutdown().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    Ok(())
}
