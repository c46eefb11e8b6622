//! Configuration resolution for P2P Chatter.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/p2p-chatter/config.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Default SOCKS endpoint of a locally running Tor client.
pub const DEFAULT_PROXY_ENDPOINT: &str = "127.0.0.1:9050";

/// Complete chatter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub files: FileConfig,
}

/// How outbound connections reach the peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Direct TCP connection.
    #[default]
    None,
    /// Route through a SOCKS5 proxy (Tor or similar overlay).
    Anonymizing,
}

impl std::str::FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "direct" => Ok(Self::None),
            "anonymizing" | "tor" | "socks5" => Ok(Self::Anonymizing),
            other => Err(Error::Config(format!("unknown proxy mode: {other}"))),
        }
    }
}

/// Process-wide network policy consumed by the transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkPolicy {
    pub proxy_mode: ProxyMode,
    /// `host:port` of the SOCKS proxy.
    pub proxy_endpoint: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            proxy_mode: ProxyMode::None,
            proxy_endpoint: Some(DEFAULT_PROXY_ENDPOINT.to_string()),
            proxy_username: None,
            proxy_password: None,
            connect_timeout_ms: 30_000,
        }
    }
}

impl NetworkPolicy {
    /// Direct connections with the given connect timeout.
    pub fn direct(connect_timeout: Duration) -> Self {
        Self {
            proxy_mode: ProxyMode::None,
            connect_timeout_ms: duration_ms(connect_timeout),
            ..Self::default()
        }
    }

    /// Anonymizing connections through the proxy at `endpoint`.
    pub fn anonymizing(endpoint: impl Into<String>) -> Self {
        Self {
            proxy_mode: ProxyMode::Anonymizing,
            proxy_endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Session and secure channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Budget for the whole key exchange, matching overlay circuit setup latency.
    pub handshake_timeout_ms: u64,
    /// Budget for a single frame write.
    pub io_timeout_ms: u64,
    /// Ratchet the channel keys after this many frames in one direction.
    pub rekey_after_frames: u64,
    /// Ratchet the channel keys after this many seconds in one epoch.
    pub rekey_after_secs: u64,
    pub max_frame_bytes: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Peer file requests decrypted at the same time; extra requests are denied.
    pub max_concurrent_file_requests: usize,
    /// File objects a peer may offer in one session.
    pub max_offered_files: usize,
    /// Total ciphertext bytes a peer may offer in one session.
    pub max_offered_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            rekey_after_frames: 65_536,
            rekey_after_secs: 15 * 60,
            max_frame_bytes: 16 * 1024 * 1024, // 16 MB
            event_capacity: 256,
            max_concurrent_file_requests: 4,
            max_offered_files: 64,
            max_offered_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl SessionConfig {
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub const fn rekey_after(&self) -> Duration {
        Duration::from_secs(self.rekey_after_secs)
    }
}

/// File object store settings.
///
/// The KDF cost parameters also drive the key exchange blinding derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    /// Default lifetime for new file objects. `0` means never expire.
    pub default_ttl_secs: u64,
    pub min_password_len: usize,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub kdf_parallelism: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 0,
            min_password_len: 4,
            kdf_memory_kib: 19 * 1024,
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl FileConfig {
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Config {
    /// Reject values that would make the system hang or misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.network.connect_timeout_ms == 0 {
            return Err(Error::Config("network.connect_timeout_ms must be > 0".into()));
        }
        if self.network.proxy_mode == ProxyMode::Anonymizing
            && self
                .network
                .proxy_endpoint
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(Error::Config(
                "network.proxy_endpoint is required when proxy_mode is anonymizing".into(),
            ));
        }
        if self.session.handshake_timeout_ms == 0 || self.session.io_timeout_ms == 0 {
            return Err(Error::Config("session timeouts must be > 0".into()));
        }
        if self.session.rekey_after_frames == 0 || self.session.rekey_after_secs == 0 {
            return Err(Error::Config("session rekey thresholds must be > 0".into()));
        }
        if self.session.max_frame_bytes < 1024 {
            return Err(Error::Config("session.max_frame_bytes must be >= 1024".into()));
        }
        if self.session.event_capacity == 0 {
            return Err(Error::Config("session.event_capacity must be > 0".into()));
        }
        if self.session.max_concurrent_file_requests == 0 {
            return Err(Error::Config("session.max_concurrent_file_requests must be > 0".into()));
        }
        if self.files.kdf_iterations == 0 || self.files.kdf_parallelism == 0 {
            return Err(Error::Config("files KDF parameters must be > 0".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    resolve_config(global.as_deref(), explicit, |key| std::env::var(key).ok())
}

/// Layer `global` and `explicit` over the defaults, then environment values
/// from `env`.
///
/// Each file only overrides the keys it sets; sections it leaves out keep
/// the values of the layers below.
pub fn resolve_config<F>(global: Option<&Path>, explicit: Option<&Path>, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = Value::Object(serde_json::Map::new());
    for (label, path) in [("global", global), ("explicit", explicit)] {
        let Some(path) = path else { continue };
        debug!(layer = label, path = %path.display(), "Loading config file");
        let layer = read_layer(path)?;
        // Type-check the layer on its own so errors name the file.
        config_from_value(path, layer.clone())?;
        merge_values(&mut merged, layer);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("merged config is invalid: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    debug!(
        proxy_mode = ?config.network.proxy_mode,
        handshake_timeout_ms = config.session.handshake_timeout_ms,
        "Configuration resolved"
    );

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".p2p-chatter").join("config.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/p2p-chatter/config.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("p2p-chatter").join("config.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read a single config file. Missing sections fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    config_from_value(path, read_layer(path)?)
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_from_value(path: &Path, value: Value) -> Result<Config> {
    serde_json::from_value(value).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// value replaces what was there.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("CHATTER_PROXY_MODE") {
        config.network.proxy_mode = val.parse()?;
    }
    if let Some(val) = env("CHATTER_PROXY_ENDPOINT") {
        config.network.proxy_endpoint = Some(val);
    }
    if let Some(val) = env("CHATTER_CONNECT_TIMEOUT_MS") {
        config.network.connect_timeout_ms = parse_env("CHATTER_CONNECT_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = env("CHATTER_HANDSHAKE_TIMEOUT_MS") {
        config.session.handshake_timeout_ms = parse_env("CHATTER_HANDSHAKE_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = env("CHATTER_FILE_TTL_SECS") {
        config.files.default_ttl_secs = parse_env("CHATTER_FILE_TTL_SECS", &val)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: invalid value {val:?}")))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
