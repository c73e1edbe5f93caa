//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// SQLite database file. `:memory:` keeps everything in memory.
    /// Env: `DATABASE_PATH`
    /// Default: `./huddle.db`
    pub database_path: PathBuf,

    /// Base URL of the identity service used for authentication and the
    /// user directory.
    /// Env: `IDENTITY_API_BASE_URL`
    /// Default: `http://localhost:8000`
    pub identity_base_url: String,

    /// Request timeout for identity service calls.
    /// Env: `IDENTITY_TIMEOUT_SECS`
    /// Default: `10`
    pub identity_timeout: Duration,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Huddle"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Per-connection outbound queue capacity. Pushes beyond it are dropped.
    /// Env: `OUTBOUND_BUFFER`
    /// Default: `256`
    pub outbound_buffer: usize,

    /// Maximum number of concurrently open sockets (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], huddle_shared::constants::DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./huddle.db"),
            identity_base_url: "http://localhost:8000".to_string(),
            identity_timeout: Duration::from_secs(10),
            instance_name: "Huddle".to_string(),
            admin_token: None,
            outbound_buffer: 256,
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        if let Some(url) = lookup("IDENTITY_API_BASE_URL") {
            if !url.is_empty() {
                config.identity_base_url = url.trim_end_matches('/').to_string();
            }
        }

        if let Some(secs) = parsed::<u64, _>(&lookup, "IDENTITY_TIMEOUT_SECS") {
            config.identity_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(n) = parsed::<usize, _>(&lookup, "OUTBOUND_BUFFER") {
            config.outbound_buffer = n.max(1);
        }

        if let Some(n) = parsed(&lookup, "MAX_CONNECTIONS") {
            config.max_connections = n;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Whether the database lives only in memory.
    pub fn is_ephemeral(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

/// Read and parse `key`, warning and returning `None` on a bad value.
fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}
