use std::path::{Path, PathBuf};
use std::time::Duration;
use merge::Merge;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_WSA_HOST: &str = "localhost";
pub const DEFAULT_WSA_PORT: u16 = 58526;
pub const DEFAULT_DEVICE_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_SSH_KEY_PATH: &str = "~/.ssh/id_rsa";

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Deserialize, Merge, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub adb_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_keygen_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub iproxy_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub idevice_id_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ideviceinfo_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub device_ssh_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub wsa_host: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub wsa_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub wsa_launch_uri: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub wsa_process_name: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub port_probe_timeout_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub port_wait_interval_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub port_wait_timeout_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub reboot_delay_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: Some("adb".to_string()),
            ssh_path: Some("ssh".to_string()),
            ssh_keygen_path: Some("ssh-keygen".to_string()),
            iproxy_path: Some("iproxy".to_string()),
            idevice_id_path: Some("idevice_id".to_string()),
            ideviceinfo_path: Some("ideviceinfo".to_string()),
            ssh_key_path: Some(DEFAULT_SSH_KEY_PATH.to_string()),
            ssh_user: Some(DEFAULT_SSH_USER.to_string()),
            device_ssh_port: Some(DEFAULT_DEVICE_SSH_PORT),
            wsa_host: Some(DEFAULT_WSA_HOST.to_string()),
            wsa_port: Some(DEFAULT_WSA_PORT),
            wsa_launch_uri: Some("wsa://".to_string()),
            wsa_process_name: Some("WsaClient".to_string()),
            port_probe_timeout_ms: Some(1000),
            port_wait_interval_ms: Some(1000),
            port_wait_timeout_ms: Some(30000),
            reboot_delay_ms: Some(5000),
            refresh_interval_secs: Some(5),
            log_level: Some("info".to_string()),
        }
    }
}

impl Config {
    /// A layer with every field unset, used when no configuration file exists.
    pub fn empty() -> Self {
        Self {
            adb_path: None, ssh_path: None, ssh_keygen_path: None, iproxy_path: None,
            idevice_id_path: None, ideviceinfo_path: None, ssh_key_path: None,
            ssh_user: None, device_ssh_port: None, wsa_host: None, wsa_port: None,
            wsa_launch_uri: None, wsa_process_name: None, port_probe_timeout_ms: None,
            port_wait_interval_ms: None, port_wait_timeout_ms: None, reboot_delay_ms: None,
            refresh_interval_secs: None, log_level: None,
        }
    }

    pub fn adb(&self) -> &str {
        self.adb_path.as_deref().unwrap_or("adb")
    }

    pub fn ssh(&self) -> &str {
        self.ssh_path.as_deref().unwrap_or("ssh")
    }

    pub fn ssh_keygen(&self) -> &str {
        self.ssh_keygen_path.as_deref().unwrap_or("ssh-keygen")
    }

    pub fn iproxy(&self) -> &str {
        self.iproxy_path.as_deref().unwrap_or("iproxy")
    }

    pub fn idevice_id(&self) -> &str {
        self.idevice_id_path.as_deref().unwrap_or("idevice_id")
    }

    pub fn ideviceinfo(&self) -> &str {
        self.ideviceinfo_path.as_deref().unwrap_or("ideviceinfo")
    }

    pub fn ssh_user(&self) -> &str {
        self.ssh_user.as_deref().unwrap_or(DEFAULT_SSH_USER)
    }

    pub fn device_ssh_port(&self) -> u16 {
        self.device_ssh_port.unwrap_or(DEFAULT_DEVICE_SSH_PORT)
    }

    pub fn wsa_host(&self) -> &str {
        self.wsa_host.as_deref().unwrap_or(DEFAULT_WSA_HOST)
    }

    pub fn wsa_port(&self) -> u16 {
        self.wsa_port.unwrap_or(DEFAULT_WSA_PORT)
    }

    /// The `host:port` pair adb uses to reach the subsystem.
    pub fn wsa_address(&self) -> String {
        format!("{}:{}", self.wsa_host(), self.wsa_port())
    }

    pub fn wsa_launch_uri(&self) -> &str {
        self.wsa_launch_uri.as_deref().unwrap_or("wsa://")
    }

    pub fn wsa_process_name(&self) -> &str {
        self.wsa_process_name.as_deref().unwrap_or("WsaClient")
    }

    pub fn port_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.port_probe_timeout_ms.unwrap_or(1000))
    }

    pub fn port_wait_interval(&self) -> Duration {
        Duration::from_millis(self.port_wait_interval_ms.unwrap_or(1000))
    }

    pub fn port_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.port_wait_timeout_ms.unwrap_or(30000))
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms.unwrap_or(5000))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.unwrap_or(5))
    }
}

pub trait ConfigService {
    /// Loads the first configuration file found. An explicit path must exist.
    fn load_from_paths(explicit: Option<&Path>) -> Result<Config, ConfigError>;
    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf>;
}
