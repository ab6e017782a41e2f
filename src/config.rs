use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::time::Duration;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HS256 secret used to verify auth tokens
    pub auth_jwt_secret: Option<String>,

    /// Name of the cookie carrying the auth token
    #[serde(default = "default_auth_cookie_name")]
    pub auth_cookie_name: String,

    /// Persistence backend. When no host is set the gateway keeps
    /// documents in process memory only.
    pub db_host: Option<String>,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    #[serde(default = "default_db_user")]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Grace period before an unused session is torn down
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,

    /// Window in which incremental updates are coalesced before being written
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Attempts for a backend write before giving up
    #[serde(default = "default_save_max_attempts")]
    pub save_max_attempts: u32,

    /// Initial backoff between write attempts, doubled on each retry
    #[serde(default = "default_save_backoff_ms")]
    pub save_backoff_ms: u64,

    /// Per-session broadcast buffer
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Connection options for the persistence backend, if one is configured
    pub fn db_connect_options(&self) -> Option<PgConnectOptions> {
        let host = self.db_host.as_ref()?;
        Some(
            PgConnectOptions::new()
                .host(host)
                .port(self.db_port)
                .username(&self.db_user)
                .password(&self.db_password)
                .database(&self.db_name),
        )
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn save_backoff(&self) -> Duration {
        Duration::from_millis(self.save_backoff_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            auth_jwt_secret: None,
            auth_cookie_name: default_auth_cookie_name(),
            db_host: None,
            db_port: default_db_port(),
            db_user: default_db_user(),
            db_password: String::new(),
            db_name: default_db_name(),
            idle_grace_secs: default_idle_grace_secs(),
            persist_debounce_ms: default_persist_debounce_ms(),
            save_max_attempts: default_save_max_attempts(),
            save_backoff_ms: default_save_backoff_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_auth_cookie_name() -> String {
    "auth_token".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "colab".to_string()
}

fn default_idle_grace_secs() -> u64 {
    30
}

fn default_persist_debounce_ms() -> u64 {
    2_000
}

fn default_save_max_attempts() -> u32 {
    5
}

fn default_save_backoff_ms() -> u64 {
    200
}

fn default_broadcast_capacity() -> usize {
    256
}
