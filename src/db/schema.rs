/// Schema for persisted session tables.
pub const SCHEMA: &str = r#"
-- Single-row credential slot for the active session
CREATE TABLE IF NOT EXISTS credentials (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    access_token TEXT NOT NULL,
    session_token TEXT,
    user_id TEXT,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
