use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
}

/// A freshly created session, ready to be transported as a cookie.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A namespace registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct Namespace {
    pub name: String,
    pub hidden: bool,
}

/// Repository for users, sessions, and the namespace registry.
#[derive(Clone)]
pub struct GatewayRepo {
    conn: Arc<Mutex<Connection>>,
}

impl GatewayRepo {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ===== User operations =====

    /// Create a new user with an already-hashed password.
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<User, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO users (id, username, password_hash) VALUES (?, ?, ?)",
            params![id, username, password_hash],
        )?;
        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
        })
    }

    /// Look up a user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, password_hash FROM users WHERE username = ?",
            params![username],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                })
            },
        )
        .optional()
    }

    // ===== Session operations =====

    /// Create a session for a user, generating a fresh random token.
    pub fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionInfo, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let token = generate_secure_token();
        conn.execute(
            "INSERT INTO sessions (id, user_id, token, expires_at) VALUES (?, ?, ?, ?)",
            params![id, user_id, token, expires_at.timestamp()],
        )?;
        Ok(SessionInfo { token, expires_at })
    }

    /// Resolve a session token to its user.
    ///
    /// Expired rows are deleted here, on first use past expiry, rather than
    /// by a background sweep. Every call re-reads the store; session validity
    /// is never cached.
    pub fn validate_session(&self, token: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT s.expires_at, u.id, u.username, u.password_hash
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?",
                params![token],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        User {
                            id: row.get(1)?,
                            username: row.get(2)?,
                            password_hash: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()?;

        match row {
            Some((expires_at, _)) if expires_at <= Utc::now().timestamp() => {
                conn.execute("DELETE FROM sessions WHERE token = ?", params![token])?;
                Ok(None)
            }
            Some((_, user)) => Ok(Some(user)),
            None => Ok(None),
        }
    }

    /// Delete a session by token. Idempotent.
    pub fn delete_session(&self, token: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE token = ?", params![token])?;
        Ok(())
    }

    // ===== Namespace operations =====

    /// List namespaces, optionally including hidden ones.
    pub fn list_namespaces(&self, include_hidden: bool) -> Result<Vec<Namespace>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let sql = if include_hidden {
            "SELECT name, hidden FROM namespaces ORDER BY name"
        } else {
            "SELECT name, hidden FROM namespaces WHERE hidden = 0 ORDER BY name"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(Namespace {
                name: row.get(0)?,
                hidden: row.get::<_, i64>(1)? != 0,
            })
        })?;
        rows.collect()
    }

    /// Look up a single namespace by name.
    pub fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, hidden FROM namespaces WHERE name = ?",
            params![name],
            |row| {
                Ok(Namespace {
                    name: row.get(0)?,
                    hidden: row.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()
    }

    /// Create a namespace. Fails on duplicate names (UNIQUE constraint).
    pub fn create_namespace(&self, name: &str, hidden: bool) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO namespaces (name, hidden) VALUES (?, ?)",
            params![name, hidden as i64],
        )?;
        Ok(())
    }

    /// Create a namespace if absent, leaving an existing row untouched.
    pub fn ensure_namespace(&self, name: &str, hidden: bool) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO namespaces (name, hidden) VALUES (?, ?)",
            params![name, hidden as i64],
        )?;
        Ok(())
    }

    /// Update the hidden flag. Returns false if the namespace does not exist.
    pub fn set_namespace_hidden(&self, name: &str, hidden: bool) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE namespaces SET hidden = ? WHERE name = ?",
            params![hidden as i64, name],
        )?;
        Ok(updated > 0)
    }

    /// Remove a namespace registry row.
    pub fn delete_namespace(&self, name: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM namespaces WHERE name = ?", params![name])?;
        Ok(())
    }
}

// ===== Helper functions =====

/// Generate a cryptographically secure random token (32 bytes, URL-safe base64).
fn generate_secure_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.r#gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup_test_repo() -> GatewayRepo {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_database(&conn).unwrap();
        GatewayRepo::new(Arc::new(Mutex::new(conn)))
    }

    fn session_count(repo: &GatewayRepo) -> i64 {
        let conn = repo.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_create_and_get_user() {
        let repo = setup_test_repo();
        let user = repo.create_user("alice", "hash123").unwrap();
        assert_eq!(user.username, "alice");

        let found = repo.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.password_hash, "hash123");

        assert!(repo.get_user_by_username("bob").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let repo = setup_test_repo();
        repo.create_user("alice", "h1").unwrap();
        let err = repo.create_user("alice", "h2").unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint"));
    }

    #[test]
    fn test_session_flow() {
        let repo = setup_test_repo();
        let user = repo.create_user("alice", "h").unwrap();

        let session = repo
            .create_session(&user.id, Utc::now() + Duration::days(7))
            .unwrap();
        let resolved = repo.validate_session(&session.token).unwrap().unwrap();
        assert_eq!(resolved.username, "alice");

        repo.delete_session(&session.token).unwrap();
        assert!(repo.validate_session(&session.token).unwrap().is_none());

        // Deleting again is a no-op.
        repo.delete_session(&session.token).unwrap();
    }

    #[test]
    fn test_expired_session_is_reaped_on_use() {
        let repo = setup_test_repo();
        let user = repo.create_user("alice", "h").unwrap();

        let session = repo
            .create_session(&user.id, Utc::now() - Duration::seconds(10))
            .unwrap();
        assert_eq!(session_count(&repo), 1);

        assert!(repo.validate_session(&session.token).unwrap().is_none());
        assert_eq!(session_count(&repo), 0);
    }

    #[test]
    fn test_tokens_are_long_and_unique() {
        use base64::Engine;
        let repo = setup_test_repo();
        let user = repo.create_user("alice", "h").unwrap();
        let expiry = Utc::now() + Duration::days(1);
        let a = repo.create_session(&user.id, expiry).unwrap();
        let b = repo.create_session(&user.id, expiry).unwrap();
        assert_ne!(a.token, b.token);

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&a.token)
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_namespace_crud() {
        let repo = setup_test_repo();
        repo.create_namespace("docs", false).unwrap();
        repo.create_namespace("secret", true).unwrap();

        let all = repo.list_namespaces(true).unwrap();
        assert_eq!(all.len(), 2);
        let visible = repo.list_namespaces(false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "docs");

        let ns = repo.get_namespace("secret").unwrap().unwrap();
        assert!(ns.hidden);

        assert!(repo.set_namespace_hidden("docs", true).unwrap());
        assert!(repo.get_namespace("docs").unwrap().unwrap().hidden);
        assert!(!repo.set_namespace_hidden("missing", true).unwrap());

        repo.delete_namespace("docs").unwrap();
        assert!(repo.get_namespace("docs").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_namespace_keeps_existing_flag() {
        let repo = setup_test_repo();
        repo.create_namespace("docs", true).unwrap();

        let err = repo.create_namespace("docs", false).unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint"));
        assert!(repo.get_namespace("docs").unwrap().unwrap().hidden);
    }

    #[test]
    fn test_ensure_namespace_is_idempotent() {
        let repo = setup_test_repo();
        repo.ensure_namespace("docs", true).unwrap();
        repo.ensure_namespace("docs", false).unwrap();
        assert!(repo.get_namespace("docs").unwrap().unwrap().hidden);
    }
}
