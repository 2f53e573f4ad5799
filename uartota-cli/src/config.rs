//! Configuration file support for uartota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UARTOTA_PORT, UARTOTA_BAUD)
//! 3. File passed with `--config`
//! 4. Local config file (./uartota.toml)
//! 5. Global config file (~/.config/uartota/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
    uartota::{DriverConfig, ReceiverConfig, SenderConfig},
};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "uartota.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Host-side transfer tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// DATA payload size.
    pub block_size: Option<usize>,
    /// How long to wait for READY/ACK.
    pub ack_timeout_ms: Option<u64>,
    /// How long to wait for COMPLETE after END.
    pub end_timeout_ms: Option<u64>,
    /// Retransmissions per frame.
    pub max_retries: Option<u32>,
}

/// Emulated device tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host silence before an in-flight transfer is dropped. `0` disables it.
    pub idle_timeout_secs: Option<u64>,
    /// Delay between COMPLETE and the restart.
    pub restart_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Sender settings.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Emulator settings.
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load the global and local files, then layer the `--config` file on top.
    pub fn load_with_override(path: Option<&Path>) -> Self {
        let mut config = Self::load();
        if let Some(path) = path {
            config.merge(Self::load_from_path(path));
        }
        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Invalid TOML in config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uartota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Set values in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.connection.port, other.connection.port);
        take(&mut self.connection.baud, other.connection.baud);

        take(&mut self.transfer.block_size, other.transfer.block_size);
        take(&mut self.transfer.ack_timeout_ms, other.transfer.ack_timeout_ms);
        take(&mut self.transfer.end_timeout_ms, other.transfer.end_timeout_ms);
        take(&mut self.transfer.max_retries, other.transfer.max_retries);

        take(&mut self.device.idle_timeout_secs, other.device.idle_timeout_secs);
        take(&mut self.device.restart_delay_ms, other.device.restart_delay_ms);
    }

    /// Sender settings with config values applied over the defaults.
    pub fn sender_config(&self) -> SenderConfig {
        let mut config = SenderConfig::default();
        if let Some(block_size) = self.transfer.block_size {
            config.block_size = block_size;
        }
        if let Some(ms) = self.transfer.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.transfer.end_timeout_ms {
            config.end_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.transfer.max_retries {
            config.max_retries = retries;
        }
        config
    }

    /// Receiver settings for the emulator.
    pub fn receiver_config(&self) -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        if let Some(ms) = self.device.restart_delay_ms {
            config.restart_delay = Duration::from_millis(ms);
        }
        config
    }

    /// Driver settings for the emulator.
    pub fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::default();
        match self.device.idle_timeout_secs {
            Some(0) => config.idle_timeout = None,
            Some(secs) => config.idle_timeout = Some(Duration::from_secs(secs)),
            None => {},
        }
        config
    }
}
