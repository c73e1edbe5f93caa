//! v002 -- Opaque one-time key tokens uploaded by clients.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_one_time_keys (
    user_id     TEXT NOT NULL,
    token       TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    PRIMARY KEY (user_id, token)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
