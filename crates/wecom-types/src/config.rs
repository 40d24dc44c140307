//! Configuration types for the callback bridge.
//!
//! Every section carries serde defaults so a config file only needs the
//! `[[accounts]]` it actually serves.

use crate::error::{WecomError, WecomResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use zeroize::Zeroizing;

/// Length of a WeCom encoding AES key in base64 characters.
pub const ENCODING_KEY_LEN: usize = 43;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WecomConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Stream session settings.
    pub stream: StreamConfig,
    /// Replay protection settings.
    pub security: SecurityConfig,
    /// Registered bot accounts.
    pub accounts: Vec<AccountConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the webhook server binds to.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8788".to_string(),
        }
    }
}

/// Stream session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Idle time after which a session is evicted, open or not.
    pub ttl_secs: u64,
    /// How often the background sweeper runs.
    pub sweep_interval_secs: u64,
    /// Upper bound on stream content bytes sent in one reply.
    pub max_content_bytes: usize,
    /// Content of the first stream reply, before any output arrives.
    pub placeholder: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_interval_secs: 30,
            max_content_bytes: 20480,
            placeholder: String::new(),
        }
    }
}

/// Replay protection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum accepted distance between request timestamp and local clock.
    pub replay_window_secs: u64,
    /// Upper bound on remembered `(timestamp, nonce)` pairs.
    pub replay_cache_capacity: usize,
    /// Reject stale timestamps and repeated nonces.
    pub reject_replays: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 300,
            replay_cache_capacity: 10_000,
            reject_replays: true,
        }
    }
}

/// One bot account bound to a webhook path.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Unique account identifier.
    pub account_id: String,
    /// Callback token shared with the platform.
    #[serde(with = "secret")]
    pub token: Zeroizing<String>,
    /// 43-character base64 encoding AES key.
    #[serde(with = "secret")]
    pub encoding_aes_key: Zeroizing<String>,
    /// Receiver id bound into every ciphertext (empty for AI bots).
    #[serde(default)]
    pub receive_id: String,
    /// HTTP path the callbacks arrive on.
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Text sent when a user opens the chat.
    #[serde(default)]
    pub welcome_text: Option<String>,
    /// Disabled accounts are skipped at registration.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Secrets are read into `Zeroizing` buffers and written back as plain strings.
mod secret {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(value: &Zeroizing<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Zeroizing<String>, D::Error> {
        String::deserialize(d).map(Zeroizing::new)
    }
}

fn default_webhook_path() -> String {
    "/wecom".to_string()
}

fn default_true() -> bool {
    true
}

// SECURITY: never print the token or key.
impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .field("encoding_aes_key", &"<redacted>")
            .field("receive_id", &self.receive_id)
            .field("webhook_path", &self.webhook_path)
            .field("welcome_text", &self.welcome_text)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl AccountConfig {
    /// Validate a single account entry.
    pub fn validate(&self) -> Result<(), String> {
        if self.account_id.trim().is_empty() {
            return Err("account_id must not be empty".to_string());
        }
        if self.token.is_empty() {
            return Err(format!("account '{}': token must not be empty", self.account_id));
        }
        if self.encoding_aes_key.len() != ENCODING_KEY_LEN {
            return Err(format!(
                "account '{}': encoding_aes_key must be {} chars (got {})",
                self.account_id,
                ENCODING_KEY_LEN,
                self.encoding_aes_key.len()
            ));
        }
        if !self.webhook_path.starts_with('/') {
            return Err(format!(
                "account '{}': webhook_path must start with '/' (got '{}')",
                self.account_id, self.webhook_path
            ));
        }
        Ok(())
    }
}

impl WecomConfig {
    /// Validate the whole configuration.
    ///
    /// Checks every account, duplicate account ids, and non-zero stream
    /// timings.
    pub fn validate(&self) -> WecomResult<()> {
        if self.stream.ttl_secs == 0 {
            return Err(WecomError::Config("stream.ttl_secs must be > 0".to_string()));
        }
        if self.stream.sweep_interval_secs == 0 {
            return Err(WecomError::Config(
                "stream.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for account in &self.accounts {
            account.validate().map_err(WecomError::Config)?;
            if !seen.insert(account.account_id.as_str()) {
                return Err(WecomError::Config(format!(
                    "duplicate account_id '{}'",
                    account.account_id
                )));
            }
        }
        Ok(())
    }

    /// Accounts that should be registered at startup.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}
