use std::env;
use std::fmt;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
///
/// All variables have defaults suitable for local development except
/// `ADMIN_PASSWORD`, which must be set so the seeded admin account never
/// ships with a known credential.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind the HTTP server to.
    pub host: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Username for the seeded admin account.
    pub admin_username: String,
    /// Password for the seeded admin account.
    pub admin_password: String,
    /// Session lifetime in days.
    pub session_expiry_days: i64,
    /// Allowed CORS origins (comma-separated in the environment).
    pub cors_origins: Vec<String>,
    /// Whether session cookies are marked `Secure` (requires HTTPS).
    pub cookie_secure: bool,
    /// S3-compatible blob storage settings.
    pub s3: S3Config,
    /// Deadline for metadata operations (stat, list, delete) in seconds.
    pub meta_timeout_secs: u64,
    /// Deadline for a whole upload in seconds.
    pub upload_timeout_secs: u64,
    /// Minimum deadline for a whole download in seconds; large payloads
    /// get proportionally more.
    pub download_min_timeout_secs: u64,
    /// Hard cap on upload size in bytes.
    pub max_upload_bytes: u64,
}

/// S3-compatible storage configuration (works with R2, MinIO, etc.).
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix under which all blobs are stored.
    pub prefix: String,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let admin_password = env::var("ADMIN_PASSWORD")
            .map_err(|_| ConfigError::MissingVar("ADMIN_PASSWORD".to_string()))?;

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3030".to_string())
                .parse()
                .unwrap_or(3030),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "./gangway.db".to_string()),
            admin_username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            admin_password,
            session_expiry_days: env::var("SESSION_EXPIRY_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .unwrap_or(7),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            cookie_secure: env::var("COOKIE_SECURE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            s3: S3Config {
                bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "gangway-data".to_string()),
                endpoint: env::var("S3_ENDPOINT").ok(),
                region: env::var("S3_REGION").unwrap_or_else(|_| "auto".to_string()),
                access_key_id: env::var("S3_ACCESS_KEY_ID").ok(),
                secret_access_key: env::var("S3_SECRET_ACCESS_KEY").ok(),
                prefix: env::var("S3_PREFIX").unwrap_or_else(|_| "blobs".to_string()),
            },
            meta_timeout_secs: env::var("META_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            upload_timeout_secs: env::var("UPLOAD_TIMEOUT_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            download_min_timeout_secs: env::var("DOWNLOAD_MIN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .unwrap_or_else(|_| "4294967296".to_string())
                .parse()
                .unwrap_or(4_294_967_296),
        })
    }

    /// Socket address string for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether enough S3 settings are present to talk to a real backend.
    pub fn is_s3_configured(&self) -> bool {
        self.s3.endpoint.is_some()
            && self.s3.access_key_id.is_some()
            && self.s3.secret_access_key.is_some()
    }

    /// Deadline for metadata operations.
    pub fn meta_timeout(&self) -> Duration {
        Duration::from_secs(self.meta_timeout_secs)
    }

    /// Deadline for a whole upload.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Deadline for a download of `size` bytes: the configured floor plus
    /// one second per MiB once the payload size is known.
    pub fn download_timeout(&self, size: Option<u64>) -> Duration {
        let floor = Duration::from_secs(self.download_min_timeout_secs);
        match size {
            Some(bytes) => floor + Duration::from_secs(bytes / (1024 * 1024)),
            None => floor,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    MissingVar(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 3030,
            database_path: ":memory:".to_string(),
            admin_username: "admin".to_string(),
            admin_password: "secret".to_string(),
            session_expiry_days: 7,
            cors_origins: vec!["http://localhost:5173".to_string()],
            cookie_secure: false,
            s3: S3Config {
                bucket: "gangway-data".to_string(),
                endpoint: None,
                region: "auto".to_string(),
                access_key_id: None,
                secret_access_key: None,
                prefix: "blobs".to_string(),
            },
            meta_timeout_secs: 10,
            upload_timeout_secs: 600,
            download_min_timeout_secs: 120,
            max_upload_bytes: 4_294_967_296,
        }
    }

    #[test]
    fn server_addr_formats_host_and_port() {
        let config = test_config();
        assert_eq!(config.server_addr(), "127.0.0.1:3030");
    }

    #[test]
    fn s3_unconfigured_without_credentials() {
        let config = test_config();
        assert!(!config.is_s3_configured());
    }

    #[test]
    fn download_timeout_scales_with_size() {
        let config = test_config();
        assert_eq!(config.download_timeout(None), Duration::from_secs(120));
        // 100 MiB adds 100 seconds on top of the floor.
        assert_eq!(
            config.download_timeout(Some(100 * 1024 * 1024)),
            Duration::from_secs(220)
        );
    }
}
