//! Configuration Vault – reads/writes `~/.fleetwatch/config.toml`.

use fleetwatch_middleware::ReconnectPolicy;
use fleetwatch_runtime::MergerConfig;
use fleetwatch_types::FleetError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroize;

/// Persisted operator configuration stored in `~/.fleetwatch/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Duplex telemetry channel endpoint.
    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    /// Root of the REST collaborator (e.g. `http://localhost:8000/api`).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Optional bearer token for the REST collaborator. Wiped from memory on
    /// drop.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_token: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Minimum movement, in degrees, for a new trajectory point.
    #[serde(default = "default_trajectory_epsilon_deg")]
    pub trajectory_epsilon_deg: f64,

    #[serde(default = "default_trajectory_max_points")]
    pub trajectory_max_points: usize,

    /// Silence after which a riding vehicle starts a fresh trajectory.
    /// Unset keeps consecutive riding sessions in one trajectory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_gap_secs: Option<u64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("channel_url", &self.channel_url)
            .field("api_base_url", &self.api_base_url)
            .field(
                "api_token",
                if self.api_token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("trajectory_epsilon_deg", &self.trajectory_epsilon_deg)
            .field("trajectory_max_points", &self.trajectory_max_points)
            .field("session_gap_secs", &self.session_gap_secs)
            .finish()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.api_token.zeroize();
    }
}

fn default_channel_url() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_api_base_url() -> String {
    "http://localhost:8000/api".to_string()
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_trajectory_epsilon_deg() -> f64 {
    1e-6
}
fn default_trajectory_max_points() -> usize {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_url: default_channel_url(),
            api_base_url: default_api_base_url(),
            api_token: String::new(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            trajectory_epsilon_deg: default_trajectory_epsilon_deg(),
            trajectory_max_points: default_trajectory_max_points(),
            session_gap_secs: None,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn merger_config(&self) -> MergerConfig {
        MergerConfig {
            epsilon_deg: self.trajectory_epsilon_deg,
            max_points: self.trajectory_max_points,
            session_gap: self.session_gap_secs.map(Duration::from_secs),
        }
    }

    /// The bearer token, if one is configured.
    pub fn api_token(&self) -> Option<String> {
        (!self.api_token.is_empty()).then(|| self.api_token.clone())
    }
}

/// Return the path to `~/.fleetwatch/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fleetwatch").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, FleetError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, FleetError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        FleetError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| FleetError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `FLEETWATCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETWATCH_CHANNEL_URL` | `channel_url` |
/// | `FLEETWATCH_API_URL` | `api_base_url` |
/// | `FLEETWATCH_API_TOKEN` | `api_token` |
/// | `FLEETWATCH_POLL_INTERVAL_SECS` | `poll_interval_secs` (ignored unless a positive integer) |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("FLEETWATCH_CHANNEL_URL") {
        cfg.channel_url = v;
    }
    if let Some(v) = var("FLEETWATCH_API_URL") {
        cfg.api_base_url = v;
    }
    if let Some(v) = var("FLEETWATCH_API_TOKEN") {
        cfg.api_token.zeroize();
        cfg.api_token = v;
    }
    if let Some(v) = var("FLEETWATCH_POLL_INTERVAL_SECS")
        && let Ok(secs) = v.trim().parse::<u64>()
        && secs > 0
    {
        cfg.poll_interval_secs = secs;
    }
}

/// Save the config to disk, creating `~/.fleetwatch/` if necessary.
pub fn save(cfg: &Config) -> Result<(), FleetError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), FleetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| FleetError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                FleetError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| FleetError::Config(format!("failed to serialise config: {e}")))?;
    write_owner_only(path, raw.as_bytes())
        .map_err(|e| FleetError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(unix)]
fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(path, bytes)
}
