//! Configuration file support for zwaflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ZWAFLASH_*)
//! 3. Local config file (./zwaflash.toml)
//! 4. Global config file (~/.config/zwaflash/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zwaflash::FirmwareSourceConfig;

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "zwaflash.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Additional USB devices to treat as adapters.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl PortConfig {
    /// Extra adapter VID/PID pairs for port classification.
    pub fn extra_ids(&self) -> Vec<(u16, u16)> {
        self.usb_device
            .iter()
            .map(|d| (d.vid, d.pid))
            .collect()
    }
}

/// Firmware source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Controller release index URL.
    pub controller_index_url: Option<String>,
    /// Bridge release index URL.
    pub bridge_index_url: Option<String>,
    /// Download proxy prefix.
    pub proxy_prefix: Option<String>,
    /// Whether downloads go through the proxy.
    pub use_proxy: Option<bool>,
}

impl FirmwareConfig {
    /// Library source settings with these overrides applied.
    pub fn sources(&self) -> FirmwareSourceConfig {
        let mut sources = FirmwareSourceConfig::default();
        if let Some(url) = &self.controller_index_url {
            sources = sources.with_controller_index_url(url.clone());
        }
        if let Some(url) = &self.bridge_index_url {
            sources = sources.with_bridge_index_url(url.clone());
        }
        if let Some(prefix) = &self.proxy_prefix {
            sources = sources.with_proxy_prefix(prefix.clone());
        }
        if let Some(use_proxy) = self.use_proxy {
            sources = sources.with_proxy(use_proxy);
        }
        sources
    }
}

/// Bridge update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// esptool program (name on PATH or full path).
    pub esptool: Option<String>,
    /// Seconds to wait for the ESP bootloader port.
    pub port_timeout_secs: Option<u64>,
    /// Seconds to wait for the adapter to be power-cycled.
    pub power_cycle_timeout_secs: Option<u64>,
}

impl BridgeConfig {
    /// Default esptool program.
    pub const DEFAULT_ESPTOOL: &'static str = "esptool.py";

    /// Default bootloader port wait.
    pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(10);

    /// esptool program to run.
    pub fn esptool(&self) -> &str {
        self.esptool
            .as_deref()
            .unwrap_or(Self::DEFAULT_ESPTOOL)
    }

    /// Bootloader port wait.
    pub fn port_timeout(&self) -> Duration {
        self.port_timeout_secs
            .map_or(Self::DEFAULT_PORT_TIMEOUT, Duration::from_secs)
    }

    /// Power-cycle wait.
    pub fn power_cycle_timeout(&self) -> Duration {
        self.power_cycle_timeout_secs
            .map_or(zwaflash::flash::DEFAULT_POWER_CYCLE_TIMEOUT, Duration::from_secs)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Firmware sources.
    #[serde(default)]
    pub firmware: FirmwareConfig,
    /// Bridge update settings.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from all available sources.
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

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn parse(content: &str, path: &Path) -> Option<Self> {
        match toml::from_str(content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Invalid TOML in config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "zwaflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other
            .port
            .serial
            .is_some()
        {
            self.port
                .serial = other
                .port
                .serial;
        }
        for device in other
            .port
            .usb_device
        {
            if !self
                .port
                .usb_device
                .contains(&device)
            {
                self.port
                    .usb_device
                    .push(device);
            }
        }

        let fw = other.firmware;
        self.firmware
            .controller_index_url = fw
            .controller_index_url
            .or(self
                .firmware
                .controller_index_url
                .take());
        self.firmware
            .bridge_index_url = fw
            .bridge_index_url
            .or(self
                .firmware
                .bridge_index_url
                .take());
        self.firmware
            .proxy_prefix = fw
            .proxy_prefix
            .or(self
                .firmware
                .proxy_prefix
                .take());
        self.firmware
            .use_proxy = fw
            .use_proxy
            .or(self
                .firmware
                .use_proxy);

        let bridge = other.bridge;
        self.bridge
            .esptool = bridge
            .esptool
            .or(self
                .bridge
                .esptool
                .take());
        self.bridge
            .port_timeout_secs = bridge
            .port_timeout_secs
            .or(self
                .bridge
                .port_timeout_secs);
        self.bridge
            .power_cycle_timeout_secs = bridge
            .power_cycle_timeout_secs
            .or(self
                .bridge
                .power_cycle_timeout_secs);
    }

    /// Save a USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        if self
            .port
            .usb_device
            .contains(&device)
        {
            return Ok(());
        }

        // Prefer the local file when the user already keeps one
        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk
            .port
            .usb_device
            .push(device);
        self.port
            .usb_device
            .push(device);

        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(
            config
                .port
                .serial
                .is_none()
        );
        assert!(
            config
                .port
                .usb_device
                .is_empty()
        );
        assert_eq!(
            config
                .bridge
                .esptool(),
            "esptool.py"
        );
        assert_eq!(
            config
                .bridge
                .power_cycle_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(
            config
                .firmware
                .sources(),
            FirmwareSourceConfig::default()
        );
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x303A,
            pid: 0x4001,
        };
        assert!(device.matches(0x303A, 0x4001));
        assert!(!device.matches(0x303A, 0x0009));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port]
serial = "/dev/ttyACM0"

[[port.usb_device]]
vid = 4292
pid = 60000

[firmware]
controller_index_url = "https://example.com/controller/latest"
use_proxy = false

[bridge]
esptool = "/opt/esptool/esptool"
port_timeout_secs = 20
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config
                .port
                .serial
                .as_deref(),
            Some("/dev/ttyACM0")
        );
        assert_eq!(
            config
                .port
                .extra_ids(),
            vec![(4292, 60000)]
        );

        let sources = config
            .firmware
            .sources();
        assert_eq!(sources.controller_index_url, "https://example.com/controller/latest");
        assert!(!sources.use_proxy);
        assert_eq!(sources.proxy_prefix, zwaflash::firmware::release::DEFAULT_PROXY_PREFIX);

        assert_eq!(
            config
                .bridge
                .esptool(),
            "/opt/esptool/esptool"
        );
        assert_eq!(
            config
                .bridge
                .port_timeout(),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(
            config
                .port
                .serial
                .is_none()
        );
        assert!(
            config
                .firmware
                .use_proxy
                .is_none()
        );
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(Config::parse("invalid toml [[[", Path::new("zwaflash.toml")).is_none());
    }

    #[test]
    fn test_merge_prefers_other_when_set() {
        let mut base = Config::default();
        base.port
            .serial = Some("/dev/ttyUSB0".into());
        base.firmware
            .use_proxy = Some(true);
        base.bridge
            .esptool = Some("esptool".into());

        let mut other = Config::default();
        other
            .firmware
            .use_proxy = Some(false);
        other
            .port
            .usb_device
            .push(UsbDevice { vid: 1, pid: 2 });

        base.merge(other);
        assert_eq!(
            base.port
                .serial
                .as_deref(),
            Some("/dev/ttyUSB0")
        );
        assert_eq!(
            base.firmware
                .use_proxy,
            Some(false)
        );
        assert_eq!(
            base.bridge
                .esptool(),
            "esptool"
        );
        assert_eq!(
            base.port
                .usb_device
                .len(),
            1
        );
    }

    #[test]
    fn test_merge_skips_duplicate_devices() {
        let device = UsbDevice { vid: 1, pid: 2 };
        let mut base = Config::default();
        base.port
            .usb_device
            .push(device);
        let mut other = Config::default();
        other
            .port
            .usb_device
            .push(device);

        base.merge(other);
        assert_eq!(
            base.port
                .usb_device
                .len(),
            1
        );
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("custom.toml");
        fs::write(
            &path,
            r#"
[port]
serial = "COM7"
[bridge]
power_cycle_timeout_secs = 90
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(
            config
                .port
                .serial
                .as_deref(),
            Some("COM7")
        );
        assert_eq!(
            config
                .bridge
                .power_cycle_timeout(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(
            config
                .port
                .serial
                .is_none()
        );
    }

    #[test]
    fn test_global_config_path_names_the_tool() {
        if let Some(p) = Config::global_config_path() {
            let p = p
                .to_str()
                .unwrap()
                .to_string();
            assert!(p.contains("zwaflash"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
