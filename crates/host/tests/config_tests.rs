//! Integration tests for configuration files
//!
//! Covers loading, saving and rejecting host configuration files on disk.

use host::config::HostConfig;
use protocol::Subnet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[host]
log_level = "debug"
interface = "wlan0"
nameserver = "local"
lock_path = "/tmp/simple-rt-test.lock"
iface_up_script = "/usr/local/lib/simple-rt/iface_up.sh"

[network]
subnet = "192.168.77.0"

[usb]
bulk_timeout_ms = 100
control_timeout_ms = 500
buffer_size = 2048
filters = ["0x04e8:*", "0x18d1:0x4ee7"]

[accessory]
manufacturer = "Example"
model = "Tether"
description = "Test accessory"
version = "2.0"
url = "https://example.com"
"#;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = HostConfig::load(Some(path)).unwrap();

    assert_eq!(config.host.log_level, "debug");
    assert_eq!(config.host.interface, "wlan0");
    assert_eq!(config.host.nameserver, "local");
    assert_eq!(
        config.network.subnet,
        Subnet::new(Ipv4Addr::new(192, 168, 77, 0)).unwrap()
    );
    assert_eq!(config.usb.filters.len(), 2);
    assert_eq!(config.accessory.model, "Tether");

    let driver = config.driver_settings(Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(driver.bulk_timeout, Duration::from_millis(100));
    assert_eq!(driver.control_timeout, Duration::from_millis(500));
    assert_eq!(driver.identity.manufacturer, "Example");
    assert_eq!(
        driver.subnet.serial_for(protocol::SessionId(2), driver.nameserver),
        "192.168.77.2,10.0.0.1"
    );
    assert_eq!(config.relay_settings().buffer_size, 2048);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.host.interface = "usb0".to_string();
    config.usb.filters = vec!["0x22b8:*".to_string()];
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.host.interface, "usb0");
    assert_eq!(loaded.usb.filters, vec!["0x22b8:*".to_string()]);
    assert_eq!(loaded.accessory, config.accessory);
}

#[test]
fn test_invalid_filter_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[host]
log_level = "info"
interface = "eth0"
nameserver = "8.8.8.8"

[usb]
filters = ["04e8:6860"]
"#,
    );

    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_invalid_log_level_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[host]
log_level = "loud"
interface = "eth0"
nameserver = "8.8.8.8"
"#,
    );

    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid log level"));
}

#[test]
fn test_malformed_toml_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[host\nlog_level = ");

    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_missing_file_rejected() {
    let dir = TempDir::new().unwrap();
    let err = HostConfig::load(Some(dir.path().join("absent.toml"))).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read config file"));
}

#[test]
fn test_default_path_is_per_user() {
    let path = HostConfig::default_path();
    assert!(path.ends_with("simple-rt/host.toml"));
}

#[test]
fn test_tilde_paths_expand() {
    let mut config = HostConfig::default();
    config.host.lock_path = "~/simple-rt.lock".to_string();

    let expanded = config.lock_path();
    assert!(!expanded.to_string_lossy().starts_with('~'));
    assert!(expanded.ends_with("simple-rt.lock"));
}
