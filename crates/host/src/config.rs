//! Host configuration management

use crate::relay::RelaySettings;
use crate::usb::DriverSettings;
use anyhow::{Context, Result, anyhow};
use protocol::{AccessoryIdentity, IPV4_MIN_HEADER_LEN, Subnet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Strings announced to the phone during the accessory handshake
    #[serde(default)]
    pub accessory: AccessoryIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// Upstream interface handed to the bring-up script
    pub interface: String,
    /// IPv4 address, or "local" for the first entry of /etc/resolv.conf
    pub nameserver: String,
    #[serde(default = "HostSettings::default_lock_path")]
    pub lock_path: String,
    #[serde(default = "HostSettings::default_iface_up_script")]
    pub iface_up_script: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            interface: "eth0".to_string(),
            nameserver: protocol::DEFAULT_NAMESERVER.to_string(),
            lock_path: Self::default_lock_path(),
            iface_up_script: Self::default_iface_up_script(),
        }
    }
}

impl HostSettings {
    fn default_lock_path() -> String {
        "/run/simple-rt.lock".to_string()
    }

    fn default_iface_up_script() -> String {
        "./iface_up.sh".to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network address of the /24 handed out to accessories
    #[serde(default)]
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "UsbSettings::default_bulk_timeout")]
    pub bulk_timeout_ms: u64,
    #[serde(default = "UsbSettings::default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Per-session and tunnel read buffer
    #[serde(default = "UsbSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// VID:PID allow-list; empty probes every device
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            bulk_timeout_ms: Self::default_bulk_timeout(),
            control_timeout_ms: Self::default_control_timeout(),
            buffer_size: Self::default_buffer_size(),
            filters: Vec::new(),
        }
    }
}

impl UsbSettings {
    fn default_bulk_timeout() -> u64 {
        200
    }

    fn default_control_timeout() -> u64 {
        1000
    }

    fn default_buffer_size() -> usize {
        4096
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p.to_string_lossy())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/simple-rt/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("simple-rt").join("host.toml")
        } else {
            PathBuf::from(".config/simple-rt/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.host.interface.is_empty() {
            return Err(anyhow!("Upstream interface must not be empty"));
        }

        if !self.host.nameserver.eq_ignore_ascii_case(crate::resolver::LOCAL)
            && self.host.nameserver.parse::<Ipv4Addr>().is_err()
        {
            return Err(anyhow!(
                "Invalid nameserver '{}', expected an IPv4 address or 'local'",
                self.host.nameserver
            ));
        }

        if self.usb.bulk_timeout_ms == 0 || self.usb.control_timeout_ms == 0 {
            return Err(anyhow!("USB timeouts must be greater than zero"));
        }

        if self.usb.buffer_size < IPV4_MIN_HEADER_LEN {
            return Err(anyhow!(
                "Buffer size {} is smaller than an IPv4 header ({} bytes)",
                self.usb.buffer_size,
                IPV4_MIN_HEADER_LEN
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x04e8:0x6860' or '0x04e8:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x18d1')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        expand_path(&self.host.lock_path)
    }

    pub fn iface_up_script(&self) -> PathBuf {
        expand_path(&self.host.iface_up_script)
    }

    /// Driver settings once the nameserver is resolved
    pub fn driver_settings(&self, nameserver: Ipv4Addr) -> DriverSettings {
        DriverSettings {
            subnet: self.network.subnet,
            nameserver,
            identity: self.accessory.clone(),
            control_timeout: Duration::from_millis(self.usb.control_timeout_ms),
            bulk_timeout: Duration::from_millis(self.usb.bulk_timeout_ms),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            subnet: self.network.subnet,
            poll_timeout: Duration::from_millis(self.usb.bulk_timeout_ms),
            buffer_size: self.usb.buffer_size,
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.host.nameserver, "8.8.8.8");
        assert_eq!(config.network.subnet, Subnet::default());
        assert_eq!(config.usb.bulk_timeout_ms, 200);
        assert!(config.usb.filters.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(HostConfig::validate_filter("0x18d1:0x2d01").is_ok());
        assert!(HostConfig::validate_filter("0x04E8:*").is_ok());
        assert!(HostConfig::validate_filter("*:0x6860").is_ok());
        assert!(HostConfig::validate_filter("*:*").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(HostConfig::validate_filter("18d1:2d01").is_err());
        assert!(HostConfig::validate_filter("0x18d1").is_err());
        assert!(HostConfig::validate_filter("0x18d1:0x2d01:0x1").is_err());
        assert!(HostConfig::validate_filter("0xGHIJ:0x2d01").is_err());
        assert!(HostConfig::validate_filter("0x18d10:0x2d01").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        config.host.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.host.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_nameserver() {
        let mut config = HostConfig::default();
        config.host.nameserver = "local".to_string();
        assert!(config.validate().is_ok());

        config.host.nameserver = "dns.google".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = HostConfig::default();
        config.usb.buffer_size = 19;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.usb.bulk_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.host.log_level, parsed.host.log_level);
        assert_eq!(config.network.subnet, parsed.network.subnet);
        assert_eq!(config.accessory, parsed.accessory);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [host]
            log_level = "debug"
            interface = "wlan0"
            nameserver = "local"

            [network]
            subnet = "192.168.42.0"
            "#,
        )
        .unwrap();

        assert_eq!(config.host.lock_path, "/run/simple-rt.lock");
        assert_eq!(
            config.network.subnet.host_address(),
            Ipv4Addr::new(192, 168, 42, 1)
        );
        assert_eq!(config.usb.buffer_size, 4096);
        assert_eq!(config.accessory.model, "SimpleRT");
    }

    #[test]
    fn test_subnet_must_be_network_address() {
        let parsed: Result<HostConfig, _> = toml::from_str(
            r#"
            [host]
            log_level = "info"
            interface = "eth0"
            nameserver = "8.8.8.8"

            [network]
            subnet = "10.1.1.7"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = HostConfig::default();
        config.usb.bulk_timeout_ms = 50;

        let driver = config.driver_settings(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(driver.bulk_timeout, Duration::from_millis(50));
        assert_eq!(driver.nameserver, Ipv4Addr::new(1, 1, 1, 1));

        let relay = config.relay_settings();
        assert_eq!(relay.poll_timeout, Duration::from_millis(50));
        assert_eq!(relay.buffer_size, 4096);
    }
}
