use rusqlite::Connection;

/// SQL schema for the gateway database.
const SCHEMA: &str = r#"
-- Users who can log in to the gateway
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL
);

-- Opaque bearer sessions; expired rows are reaped when they are next touched
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token TEXT UNIQUE NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token);
CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);

-- Named storage areas; hidden namespaces require a session to read
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    hidden INTEGER NOT NULL DEFAULT 0
);
"#;

/// Initialize the database schema. Idempotent.
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'sessions', 'namespaces')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }

    #[test]
    fn test_username_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        conn.execute(
            "INSERT INTO users (id, username, password_hash) VALUES ('u1', 'alice', 'h')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO users (id, username, password_hash) VALUES ('u2', 'alice', 'h')",
            [],
        );
        assert!(err.is_err());
    }
}
