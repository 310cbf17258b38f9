use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::manager::SessionPolicy;
use crate::session::{DisplaySettings, FeatureFlags};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [session]
//                    idle_timeout_secs = 600
//
//   env var:         GATEWAY_SESSION__IDLE_TIMEOUT_SECS=600   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub cache: CacheFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub host: HostFileConfig,
}

/// Listener address (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Per-session behaviour, copied into every session at creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Owner inactivity before the session is closed. 0 disables.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Guest inactivity before its slot is freed. 0 disables.
    #[serde(default = "default_guest_idle_timeout_secs")]
    pub guest_idle_timeout_secs: u64,
    #[serde(default = "default_resize_settle_ms")]
    pub resize_settle_ms: u64,
    #[serde(default = "default_max_active_guests")]
    pub max_active_guests: usize,
    #[serde(default = "default_true")]
    pub reconnect_on_resize: bool,
    #[serde(default = "default_true")]
    pub allow_clipboard: bool,
    #[serde(default)]
    pub allow_file_transfer: bool,
    #[serde(default = "default_true")]
    pub allow_print: bool,
    #[serde(default = "default_true")]
    pub allow_sharing: bool,
    #[serde(default = "default_true")]
    pub allow_audio: bool,
    #[serde(default)]
    pub default_width: Option<u32>,
    #[serde(default)]
    pub default_height: Option<u32>,
    #[serde(default)]
    pub default_quality: Option<u8>,
    /// How long a terminated session stays addressable.
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            guest_idle_timeout_secs: default_guest_idle_timeout_secs(),
            resize_settle_ms: default_resize_settle_ms(),
            max_active_guests: default_max_active_guests(),
            reconnect_on_resize: true,
            allow_clipboard: true,
            allow_file_transfer: false,
            allow_print: true,
            allow_sharing: true,
            allow_audio: true,
            default_width: None,
            default_height: None,
            default_quality: None,
            linger_secs: default_linger_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheFileConfig {
    #[serde(default = "default_image_ttl_ms")]
    pub image_ttl_ms: u64,
    #[serde(default = "default_audio_ttl_ms")]
    pub audio_ttl_ms: u64,
}

impl Default for CacheFileConfig {
    fn default() -> Self {
        Self {
            image_ttl_ms: default_image_ttl_ms(),
            audio_ttl_ms: default_audio_ttl_ms(),
        }
    }
}

/// Client transport tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
    #[serde(default = "default_push_batch_max_items")]
    pub push_batch_max_items: usize,
    /// 0 sends every item on its own.
    #[serde(default = "default_push_batch_delay_ms")]
    pub push_batch_delay_ms: u64,
    #[serde(default = "default_long_poll_duration_ms")]
    pub long_poll_duration_ms: u64,
    /// 0 makes a plain poll return immediately when nothing is pending.
    #[serde(default)]
    pub poll_wait_ms: u64,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            send_channel_capacity: default_send_channel_capacity(),
            push_batch_max_items: default_push_batch_max_items(),
            push_batch_delay_ms: default_push_batch_delay_ms(),
            long_poll_duration_ms: default_long_poll_duration_ms(),
            poll_wait_ms: 0,
        }
    }
}

/// Display host programs (lives under `[host]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostFileConfig {
    #[serde(default = "default_rdp_program")]
    pub rdp_program: String,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    /// Directory for the per-session sockets. Defaults to `<data_dir>/run`.
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HostFileConfig {
    fn default() -> Self {
        Self {
            rdp_program: default_rdp_program(),
            ssh_program: default_ssh_program(),
            runtime_dir: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_guest_idle_timeout_secs() -> u64 {
    300
}
fn default_resize_settle_ms() -> u64 {
    500
}
fn default_max_active_guests() -> usize {
    3
}
fn default_linger_secs() -> u64 {
    60
}
fn default_image_ttl_ms() -> u64 {
    1000
}
fn default_audio_ttl_ms() -> u64 {
    2000
}
fn default_send_channel_capacity() -> usize {
    100
}
fn default_push_batch_max_items() -> usize {
    8
}
fn default_push_batch_delay_ms() -> u64 {
    10
}
fn default_long_poll_duration_ms() -> u64 {
    60_000
}
fn default_rdp_program() -> String {
    "remote-display-rdp".to_string()
}
fn default_ssh_program() -> String {
    "remote-display-ssh".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Build the layered figment: struct defaults, then `config.toml`, then env.
///
/// Env vars use double-underscore for nesting into sections:
///   `GATEWAY_SESSION__MAX_ACTIVE_GUESTS=5`  →  `session.max_active_guests = 5`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("GATEWAY_").split("__"))
}

fn optional_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

// =============================================================================
// Runtime config (durations resolved, read once at start-up)
// =============================================================================

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub send_channel_capacity: usize,
    pub push_batch_max_items: usize,
    pub push_batch_delay: Duration,
    pub long_poll_duration: Duration,
    pub poll_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct HostSettings {
    pub rdp_program: String,
    pub ssh_program: String,
    pub runtime_dir: PathBuf,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub session: SessionPolicy,
    /// How long terminated sessions stay in the registry.
    pub linger: Duration,
    pub transport: TransportConfig,
    pub hosts: HostSettings,
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig, data_dir: &Path) -> Self {
        let s = &fc.session;
        let session = SessionPolicy {
            idle_timeout: optional_secs(s.idle_timeout_secs),
            guest_idle_timeout: optional_secs(s.guest_idle_timeout_secs),
            resize_settle: Duration::from_millis(s.resize_settle_ms),
            max_active_guests: s.max_active_guests,
            reconnect_on_resize: s.reconnect_on_resize,
            features: FeatureFlags {
                clipboard: s.allow_clipboard,
                file_transfer: s.allow_file_transfer,
                print: s.allow_print,
                sharing: s.allow_sharing,
                audio: s.allow_audio,
            },
            default_display: DisplaySettings {
                width: s.default_width,
                height: s.default_height,
                quality: s.default_quality,
                ..Default::default()
            },
            image_ttl: Duration::from_millis(fc.cache.image_ttl_ms),
            audio_ttl: Duration::from_millis(fc.cache.audio_ttl_ms),
            push_capacity: fc.transport.send_channel_capacity,
        };

        Self {
            data_dir: data_dir.to_path_buf(),
            host: fc
                .server
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: fc.server.port.unwrap_or(8080),
            session,
            linger: Duration::from_secs(s.linger_secs),
            transport: TransportConfig {
                send_channel_capacity: fc.transport.send_channel_capacity,
                push_batch_max_items: fc.transport.push_batch_max_items.max(1),
                push_batch_delay: Duration::from_millis(fc.transport.push_batch_delay_ms),
                long_poll_duration: Duration::from_millis(fc.transport.long_poll_duration_ms),
                poll_wait: Duration::from_millis(fc.transport.poll_wait_ms),
            },
            hosts: HostSettings {
                rdp_program: fc.host.rdp_program.clone(),
                ssh_program: fc.host.ssh_program.clone(),
                runtime_dir: fc
                    .host
                    .runtime_dir
                    .clone()
                    .unwrap_or_else(|| data_dir.join("run")),
                connect_timeout: Duration::from_secs(fc.host.connect_timeout_secs),
            },
        }
    }

    /// Policy each new session copies.
    pub fn session_policy(&self) -> SessionPolicy {
        self.session.clone()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(
            &FileConfig::default(),
            &std::env::temp_dir().join("session-gateway"),
        )
    }
}

/// Resolve and create the data directory.
pub fn resolve_data_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    let data_dir = match custom_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not find home directory")?
            .join(".session-gateway"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
    info!("Data directory: {}", data_dir.display());
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.session.resize_settle_ms, 500);
        assert_eq!(fc.session.max_active_guests, 3);
        assert!(fc.session.reconnect_on_resize);
        assert_eq!(fc.cache.image_ttl_ms, 1000);
        assert_eq!(fc.cache.audio_ttl_ms, 2000);
        assert_eq!(fc.transport.send_channel_capacity, 100);
        assert_eq!(fc.transport.long_poll_duration_ms, 60_000);
        assert_eq!(fc.host.connect_timeout_secs, 10);
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = GatewayConfig::from_file(&FileConfig::default(), Path::new("/data"));
        assert!(config.session.idle_timeout.is_none());
        assert_eq!(
            config.session.guest_idle_timeout,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.hosts.runtime_dir, PathBuf::from("/data/run"));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_policy_carries_features_and_display_defaults() {
        let fc = FileConfig {
            session: SessionFileConfig {
                allow_clipboard: false,
                allow_sharing: false,
                default_width: Some(1280),
                default_height: Some(720),
                default_quality: Some(60),
                ..Default::default()
            },
            ..Default::default()
        };
        let policy = GatewayConfig::from_file(&fc, Path::new("/data")).session_policy();
        assert!(!policy.features.clipboard);
        assert!(!policy.features.sharing);
        assert!(policy.features.print);
        assert_eq!(policy.default_display.width, Some(1280));
        assert_eq!(policy.default_display.quality, Some(60));
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.server.host.is_none());
        assert_eq!(fc.transport.push_batch_max_items, 8);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nport = 9090\n\n[session]\nidle_timeout_secs = 600\nmax_active_guests = 1\n\n[host]\nrdp_program = \"/opt/rdp-host\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, Some(9090));
        assert_eq!(fc.session.idle_timeout_secs, 600);
        assert_eq!(fc.session.max_active_guests, 1);
        assert_eq!(fc.host.rdp_program, "/opt/rdp-host");
        // untouched keys keep their defaults
        assert_eq!(fc.session.resize_settle_ms, 500);
    }

    #[test]
    fn test_resolve_data_dir_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("gateway");
        let resolved = resolve_data_dir(Some(dir.clone())).unwrap();
        assert_eq!(resolved, dir);
        assert!(dir.is_dir());
    }
}
