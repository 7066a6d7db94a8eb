use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration. Every field is fixed and typed; unknown keys
/// in the config file are ignored, missing ones take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,

    /// Database URL
    pub database_url: String,

    pub overlay: OverlayConfig,
    pub connection: ConnectionConfig,
    pub shares: SharesConfig,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Control CLI of the overlay client
    pub cli_path: PathBuf,

    /// Daemon binary that needs network capabilities
    pub daemon_binary: PathBuf,

    /// systemd unit of the daemon
    pub service_name: String,

    /// Token file written by the daemon (root readable)
    pub auth_token_path: PathBuf,

    /// User readable copy created by `init_auth_token`
    pub user_token_path: PathBuf,

    /// Elevation helper for privileged operations
    pub elevate_command: String,

    pub install_command: Vec<String>,
    pub uninstall_command: Vec<String>,

    #[serde(with = "duration_str")]
    pub monitor_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Port of the device HTTP API, also used for reachability probes
    pub api_port: u16,

    /// Interface name prefix of the overlay network adapter
    pub overlay_interface_prefix: String,

    /// Hosts probed on every discovery scan
    pub known_hosts: Vec<String>,

    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,

    #[serde(with = "duration_str")]
    pub ready_timeout: Duration,

    #[serde(with = "duration_str")]
    pub ready_interval: Duration,

    /// Number of recent connections kept
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharesConfig {
    pub smbclient_path: PathBuf,
    pub gio_path: PathBuf,
    pub workgroup: String,

    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Maximum number of jobs transferring at once (0 = auto based on CPU)
    pub max_concurrent_jobs: usize,

    /// Minimum cadence of progress events within a file
    #[serde(with = "duration_str")]
    pub progress_interval: Duration,

    /// Sliding window used for speed computation
    #[serde(with = "duration_str")]
    pub speed_window: Duration,

    #[serde(with = "duration_str")]
    pub scheduler_tick: Duration,

    /// Exclude patterns applied to every job
    pub default_excludes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("devicelink");

        Self {
            server: ServerConfig::default(),
            database_url: format!("sqlite://{}/devicelink.db", data_dir.display()),
            overlay: OverlayConfig::default(),
            connection: ConnectionConfig::default(),
            shares: SharesConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8888 }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        let user_token_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("devicelink")
            .join("authtoken.secret");

        Self {
            cli_path: PathBuf::from("/usr/sbin/zerotier-cli"),
            daemon_binary: PathBuf::from("/usr/sbin/zerotier-one"),
            service_name: "zerotier-one".to_string(),
            auth_token_path: PathBuf::from("/var/lib/zerotier-one/authtoken.secret"),
            user_token_path,
            elevate_command: "pkexec".to_string(),
            install_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "curl -s https://install.zerotier.com | bash".to_string(),
            ],
            uninstall_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "apt-get remove -y zerotier-one || dnf remove -y zerotier-one".to_string(),
            ],
            monitor_interval: Duration::from_millis(1000),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            api_port: 80,
            overlay_interface_prefix: "zt".to_string(),
            known_hosts: Vec::new(),
            probe_timeout: Duration::from_millis(800),
            ready_timeout: Duration::from_secs(30),
            ready_interval: Duration::from_millis(500),
            history_limit: 10,
        }
    }
}

impl Default for SharesConfig {
    fn default() -> Self {
        Self {
            smbclient_path: PathBuf::from("smbclient"),
            gio_path: PathBuf::from("gio"),
            workgroup: "WORKGROUP".to_string(),
            command_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0, // Auto-detect
            progress_interval: Duration::from_millis(500),
            speed_window: Duration::from_secs(5),
            scheduler_tick: Duration::from_secs(30),
            default_excludes: vec![
                "node_modules".to_string(),
                "__pycache__".to_string(),
                "*.pyc".to_string(),
                ".cache".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
                "*.partial".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load config from defaults, an optional TOML file and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let path = std::env::var("DEVICELINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("devicelink")
                    .join("config.toml")
            });

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("DEVICELINK")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("connection.known_hosts")
                    .with_list_parse_key("backup.default_excludes")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;

        // Auto-detect workers if not set
        if config.backup.max_concurrent_jobs == 0 {
            config.backup.max_concurrent_jobs = std::cmp::max(1, num_cpus::get() / 2);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.overlay.cli_path.as_os_str().is_empty() {
            bail!("overlay.cli_path must be set");
        }
        if self.overlay.elevate_command.trim().is_empty() {
            bail!("overlay.elevate_command must be set");
        }
        for (name, value) in [
            ("overlay.monitor_interval", self.overlay.monitor_interval),
            ("connection.probe_timeout", self.connection.probe_timeout),
            ("connection.ready_interval", self.connection.ready_interval),
            ("backup.progress_interval", self.backup.progress_interval),
            ("backup.speed_window", self.backup.speed_window),
            ("backup.scheduler_tick", self.backup.scheduler_tick),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.connection.history_limit == 0 {
            bail!("connection.history_limit must be at least 1");
        }
        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Durations as human strings ("1s", "500ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
