/// Protocol version string reported by the server
pub const PROTOCOL_VERSION: &str = "/huddle/1.0.0";

/// Fixed id of the sitewide conversation every user belongs to
pub const MASTER_CONVERSATION_ID: &str = "master";

/// Display name of the master conversation
pub const MASTER_CONVERSATION_NAME: &str = "All Users";

/// Default page size for `events:fetch`
pub const EVENT_PAGE_SIZE: u32 = 20;

/// Page size used by the identity provider for followings and search
pub const SOCIAL_PAGE_SIZE: u32 = 10;

/// Maximum inbound frame size in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Maximum message text length in characters
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Default HTTP/WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 3000;
