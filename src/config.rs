//! Configuration loading and types for markstation
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/markstation/config.toml)
//! 3. Environment variables (MARKSTATION_*)
//! 4. CLI arguments (highest priority)

use crate::error::StationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often the card reader is polled for presence changes
pub const CARD_POLLING_INTERVAL_MS: u64 = 100;

/// Quiet period after the last vote change before the ballot is written to the card
pub const CARD_LONG_VALUE_WRITE_DELAY_MS: u64 = 1000;

/// Lifetime of a voter card after it is issued
pub const CARD_EXPIRATION_SECONDS: i64 = 60 * 60;

/// Number of digits in an administrator passcode
pub const PASSCODE_LENGTH: usize = 6;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Markstation Configuration
#
# Location: ~/.config/markstation/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (status bars, kiosk supervisors)
# Use "auto" for default location ($XDG_RUNTIME_DIR/markstation/state),
# a custom path, or "disabled" to turn off. The daemon writes the screen
# being shown ("insert_card", "ballot", "poll_worker", "wrong_precinct", ...)
# to this file whenever it changes.
state_file = "auto"

[card]
# Card reader backend: "file" or "memory"
# - file: reads and writes a JSON slot file (useful with a reader bridge)
# - memory: in-process card, starts empty (development only)
backend = "file"

# Slot file used by the file backend
# Use "auto" for $XDG_RUNTIME_DIR/markstation/card.json
slot_path = "auto"

# How often to poll the card reader, in milliseconds
poll_interval_ms = 100

# Quiet period after the last vote change before the ballot is saved
# to the card, in milliseconds
write_delay_ms = 1000

[auth]
# Seconds a voter card stays valid after it was issued
voter_card_expiration_secs = 3600

# Digits in an election manager / system administrator passcode
passcode_length = 6

# Wrong passcode entries allowed before the card is locked out.
# The lockout lasts until the card is removed.
max_passcode_attempts = 5

# Let an election manager card for another election log in, so it can
# load a replacement election
allow_election_managers_other_election = true

# Let election managers and poll workers log in before any election
# is configured
allow_unconfigured_login = true

[storage]
# Directory for device storage (loaded election, precinct, counters)
# Use "auto" for the platform data directory
path = "auto"

# [machine]
# JSON file with { "appModeKey", "machineId", "codeVersion" }
# When missing or unreadable, defaults are used
# config_path = "/etc/markstation/machine.json"
"#;

/// Card reader backend
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardBackend {
    /// JSON slot file on disk
    #[default]
    File,
    /// In-process card (development and tests)
    Memory,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub card: CardConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub machine: MachineConfig,

    /// Optional path to state file for external integrations
    /// When set, the daemon writes the current screen to this file
    #[serde(default)]
    pub state_file: Option<String>,
}

/// Card reader configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CardConfig {
    #[serde(default)]
    pub backend: CardBackend,

    #[serde(default = "default_auto")]
    pub slot_path: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_write_delay_ms")]
    pub write_delay_ms: u64,
}

/// Authentication policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_voter_card_expiration_secs")]
    pub voter_card_expiration_secs: i64,

    #[serde(default = "default_passcode_length")]
    pub passcode_length: usize,

    #[serde(default = "default_max_passcode_attempts")]
    pub max_passcode_attempts: u32,

    #[serde(default = "default_true")]
    pub allow_election_managers_other_election: bool,

    #[serde(default = "default_true")]
    pub allow_unconfigured_login: bool,
}

/// Device storage location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_auto")]
    pub path: String,
}

/// Machine identity source
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_poll_interval_ms() -> u64 {
    CARD_POLLING_INTERVAL_MS
}

fn default_write_delay_ms() -> u64 {
    CARD_LONG_VALUE_WRITE_DELAY_MS
}

fn default_voter_card_expiration_secs() -> i64 {
    CARD_EXPIRATION_SECONDS
}

fn default_passcode_length() -> usize {
    PASSCODE_LENGTH
}

fn default_max_passcode_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            backend: CardBackend::default(),
            slot_path: default_auto(),
            poll_interval_ms: default_poll_interval_ms(),
            write_delay_ms: default_write_delay_ms(),
        }
    }
}

impl CardConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    /// Resolve the slot file path, expanding "auto"
    pub fn resolve_slot_path(&self) -> PathBuf {
        match self.slot_path.to_lowercase().as_str() {
            "auto" => Config::runtime_dir().join("card.json"),
            _ => PathBuf::from(&self.slot_path),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            voter_card_expiration_secs: default_voter_card_expiration_secs(),
            passcode_length: default_passcode_length(),
            max_passcode_attempts: default_max_passcode_attempts(),
            allow_election_managers_other_election: true,
            allow_unconfigured_login: true,
        }
    }
}

impl AuthConfig {
    /// How long a voter card stays valid after it was issued
    pub fn voter_card_expiration(&self) -> Result<chrono::Duration, StationError> {
        let secs = self.voter_card_expiration_secs;
        if secs < 0 {
            return Err(StationError::Config(format!(
                "auth.voter_card_expiration_secs must not be negative, got {}",
                secs
            )));
        }
        chrono::Duration::try_seconds(secs).ok_or_else(|| {
            StationError::Config(format!(
                "auth.voter_card_expiration_secs is out of range: {}",
                secs
            ))
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_auto(),
        }
    }
}

impl StorageConfig {
    /// Resolve the storage directory, expanding "auto"
    pub fn resolve_path(&self) -> PathBuf {
        match self.path.to_lowercase().as_str() {
            "auto" => Config::data_dir().join("storage"),
            _ => PathBuf::from(&self.path),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            card: CardConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            machine: MachineConfig::default(),
            state_file: Some("auto".to_string()),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "markstation")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the runtime directory for ephemeral files (state, card slot)
    pub fn runtime_dir() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, otherwise fall back to /tmp
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("markstation")
    }

    /// Resolve the state file path from config
    /// Returns None if state_file is not configured or explicitly disabled
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        self.state_file
            .as_ref()
            .and_then(|path| match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("state")),
                _ => Some(PathBuf::from(path)),
            })
    }

    /// Get the data directory path (device storage lives here)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "markstation")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, StationError> {
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| StationError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| StationError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.auth.voter_card_expiration()?;

    Ok(config)
}

/// Apply MARKSTATION_* overrides through a lookup function
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(backend) = lookup("MARKSTATION_CARD_BACKEND") {
        config.card.backend = match backend.to_lowercase().as_str() {
            "memory" => CardBackend::Memory,
            _ => CardBackend::File,
        };
    }
    if let Some(slot) = lookup("MARKSTATION_CARD_SLOT") {
        config.card.slot_path = slot;
    }
    if let Some(path) = lookup("MARKSTATION_STORAGE_PATH") {
        config.storage.path = path;
    }
    if let Some(path) = lookup("MARKSTATION_MACHINE_CONFIG") {
        config.machine.config_path = Some(PathBuf::from(path));
    }
    if let Some(delay) = lookup("MARKSTATION_WRITE_DELAY_MS") {
        match delay.parse() {
            Ok(ms) => config.card.write_delay_ms = ms,
            Err(_) => tracing::warn!("Ignoring invalid MARKSTATION_WRITE_DELAY_MS: {}", delay),
        }
    }
}

/// Save configuration to file
pub fn save_config(config: &Config, path: &Path) -> Result<(), StationError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StationError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = toml::to_string_pretty(config)
        .map_err(|e| StationError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| StationError::Config(format!("Failed to write config: {}", e)))?;

    Ok(())
}
