use crate::auth::Authenticator;
use crate::crypto::SettingsCipher;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub api_addr: String,
    pub realtime_addr: String,
    pub db_path: PathBuf,
}

/// Secrets normally arrive through the environment, not the file
#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Base64 of exactly 32 bytes
    pub encryption_key: String,
    pub signing_secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl SecurityConfig {
    pub fn cipher(&self) -> Result<SettingsCipher> {
        SettingsCipher::from_base64(&self.encryption_key)
    }

    pub fn authenticator(&self) -> Result<Authenticator> {
        Authenticator::new(&self.signing_secret)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_key", &"<redacted>")
            .field("signing_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Events queued per subscriber before new ones are dropped for it
    pub subscriber_buffer: usize,
    pub max_frame_bytes: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            max_frame_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub debounce_ms: u64,
    pub request_timeout_ms: u64,
}

impl ClientConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 800,
            request_timeout_ms: 10_000,
        }
    }
}

fn default_token_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

impl Config {
    /// Load from a TOML file layered with `SETTINGSYNC__SECTION__KEY` variables
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SETTINGSYNC").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Fail fast on key material before anything is bound or opened
    pub fn validate(&self) -> Result<()> {
        self.security.cipher()?;
        self.security.authenticator()?;
        Ok(())
    }
}
