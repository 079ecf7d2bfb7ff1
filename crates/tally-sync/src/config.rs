//! # Tally Configuration
//!
//! Configuration for the sync engine, the gate, rotation and providers.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_VAULT_KEY=<64 hex chars>                                     │
//! │     TALLY_DB_PATH=/var/lib/tally/tally.db                              │
//! │     TALLY_SQUARE_BASE_URL=https://connect.squareupsandbox.com          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/dev.tally.tally/tally.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tally.toml
//! [database]
//! path = "/var/lib/tally/tally.db"
//! max_connections = 5
//!
//! [gate]
//! initial_backoff_secs = 30
//! max_backoff_secs = 1800
//! jitter = 0.2
//! pause_threshold = 5
//! pause_cooldown_secs = 3600
//!
//! [sync]
//! retries = 1
//! request_timeout_secs = 20
//! page_size = 100
//! max_pages = 500
//!
//! [rotation]
//! failure_threshold = 10
//! open_secs = 21600
//! reopen_secs = 43200
//! lead_secs = 86400
//!
//! [providers.square]
//! base_url = "https://connect.squareup.com"
//! ```
//!
//! The vault key may sit in the file for local setups; in production it only
//! comes from `TALLY_VAULT_KEY`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gate::BackoffPolicy;
use crate::provider::BUILTIN_PROVIDERS;
use tally_core::{BreakerPolicy, PausePolicy, VaultKey};

// =============================================================================
// Database Settings
// =============================================================================

/// Where the SQLite file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database file. Defaults to `<data dir>/tally.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Vault Settings
// =============================================================================

/// Credential vault key.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct VaultSettings {
    #[serde(default, skip_serializing)]
    pub key_hex: Option<String>,
}

impl std::fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSettings")
            .field("key_hex", &self.key_hex.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Gate Settings
// =============================================================================

/// Scheduling gate backoff and pause.
///
/// ```text
/// failures:   1     2     3      4      5 ──► paused for pause_cooldown_secs
/// backoff:   30s   60s  120s   240s   480s ... capped at max_backoff_secs
///            (each ± jitter)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Randomization factor in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: u32,

    #[serde(default = "default_pause_cooldown")]
    pub pause_cooldown_secs: u64,
}

fn default_initial_backoff() -> u64 {
    30
}
fn default_max_backoff() -> u64 {
    30 * 60
}
fn default_jitter() -> f64 {
    0.2
}
fn default_pause_threshold() -> u32 {
    tally_core::PAUSE_THRESHOLD
}
fn default_pause_cooldown() -> u64 {
    60 * 60
}

impl Default for GateSettings {
    fn default() -> Self {
        GateSettings {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            jitter: default_jitter(),
            pause_threshold: default_pause_threshold(),
            pause_cooldown_secs: default_pause_cooldown(),
        }
    }
}

impl GateSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_backoff_secs),
            max: Duration::from_secs(self.max_backoff_secs),
            jitter: self.jitter,
        }
    }

    pub fn pause_policy(&self) -> PausePolicy {
        PausePolicy {
            threshold: self.pause_threshold,
            cooldown: Duration::from_secs(self.pause_cooldown_secs),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Fetch behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Immediate retries of the whole fetch (0 = no retry).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Timeout applied to every provider request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Page size requested from providers that take one.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Guard against providers that never stop paginating.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_retries() -> u32 {
    1
}
fn default_request_timeout() -> u64 {
    20
}
fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            retries: default_retries(),
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Rotation Settings
// =============================================================================

/// Credential rotation breaker and horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_secs")]
    pub open_secs: u64,

    #[serde(default = "default_reopen_secs")]
    pub reopen_secs: u64,

    /// Credentials expiring within this window are rotated.
    #[serde(default = "default_lead_secs")]
    pub lead_secs: u64,
}

fn default_failure_threshold() -> u32 {
    tally_core::ROTATION_FAILURE_THRESHOLD
}
fn default_open_secs() -> u64 {
    6 * 60 * 60
}
fn default_reopen_secs() -> u64 {
    12 * 60 * 60
}
fn default_lead_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RotationSettings {
    fn default() -> Self {
        RotationSettings {
            failure_threshold: default_failure_threshold(),
            open_secs: default_open_secs(),
            reopen_secs: default_reopen_secs(),
            lead_secs: default_lead_secs(),
        }
    }
}

impl RotationSettings {
    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold,
            open_for: Duration::from_secs(self.open_secs),
            reopen_for: Duration::from_secs(self.reopen_secs),
        }
    }

    pub fn lead(&self) -> Duration {
        Duration::from_secs(self.lead_secs)
    }
}

// =============================================================================
// Provider Settings
// =============================================================================

/// Per-provider overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Replaces the vendor's production API root (sandboxes, tests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

// =============================================================================
// Tally Config (Root)
// =============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub vault: VaultSettings,

    #[serde(default)]
    pub gate: GateSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub rotation: RotationSettings,

    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl TallyConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        let gate = &self.gate;
        if gate.initial_backoff_secs == 0 || gate.initial_backoff_secs > gate.max_backoff_secs {
            return Err(SyncError::InvalidConfig(format!(
                "gate backoff must satisfy 0 < initial ({}) <= max ({})",
                gate.initial_backoff_secs, gate.max_backoff_secs
            )));
        }
        if !(0.0..1.0).contains(&gate.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "gate.jitter must be in [0, 1), got {}",
                gate.jitter
            )));
        }
        if gate.pause_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "gate.pause_threshold must be greater than 0".into(),
            ));
        }

        if self.sync.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.sync.page_size == 0 || self.sync.max_pages == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.page_size and sync.max_pages must be greater than 0".into(),
            ));
        }

        if self.rotation.failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "rotation.failure_threshold must be greater than 0".into(),
            ));
        }

        for (id, provider) in &self.providers {
            if let Some(ref base_url) = provider.base_url {
                let parsed = url::Url::parse(base_url)?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(SyncError::InvalidConfig(format!(
                        "providers.{}.base_url must be http(s), got: {}",
                        id, base_url
                    )));
                }
            }
        }

        // A malformed key is a configuration error, surfaced at load time.
        if self.vault.key_hex.is_some() {
            self.vault_key()?;
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from any variable source.
    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(key) = var("TALLY_VAULT_KEY") {
            debug!("Vault key taken from environment");
            self.vault.key_hex = Some(key);
        }

        if let Some(retries) = var("TALLY_SYNC_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.sync.retries = n,
                Err(_) => warn!(value = %retries, "Ignoring invalid TALLY_SYNC_RETRIES"),
            }
        }

        if let Some(timeout) = var("TALLY_REQUEST_TIMEOUT_SECS") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.sync.request_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring invalid TALLY_REQUEST_TIMEOUT_SECS"),
            }
        }

        for id in BUILTIN_PROVIDERS {
            let name = format!("TALLY_{}_BASE_URL", id.to_uppercase());
            if let Some(url) = var(&name) {
                debug!(provider = id, url = %url, "Overriding provider base URL from environment");
                self.providers.entry(id.to_string()).or_default().base_url = Some(url);
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Database file path, defaulting to the platform data directory.
    pub fn database_path(&self) -> SyncResult<PathBuf> {
        if let Some(ref path) = self.database.path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("dev", "tally", "tally")
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory available".into()))
    }

    /// Parses the vault key.
    pub fn vault_key(&self) -> SyncResult<VaultKey> {
        let hex = self.vault.key_hex.as_deref().ok_or_else(|| {
            SyncError::InvalidConfig("vault key not configured (set TALLY_VAULT_KEY)".into())
        })?;
        Ok(VaultKey::from_hex(hex)?)
    }

    /// Base URL override for a provider.
    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .and_then(|settings| settings.base_url.as_deref())
    }
}
