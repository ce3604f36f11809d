//! USB subsystem
//!
//! Everything that touches libusb lives here:
//! - the device and handle traits the accessory driver is written against
//! - their `rusb` implementations
//! - the AOA probe, handshake and bulk packet I/O (`driver`)
//! - a scripted in-memory device for tests (`mock`)

pub mod driver;
pub mod mock;

use common::UsbLocation;
use protocol::aoa::{DEFAULT_EP_IN, DEFAULT_EP_OUT};
use protocol::is_accessory_mode;
use rusb::{Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

pub use driver::{AccessoryLink, DriverSettings, ProbeError, ProbeOutcome, probe};

/// Direction bit of an endpoint address
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Bulk endpoint pair of the accessory interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub input: u8,
    pub output: u8,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            input: DEFAULT_EP_IN,
            output: DEFAULT_EP_OUT,
        }
    }
}

impl Endpoints {
    /// Pick the IN/OUT pair out of the first two endpoint addresses
    ///
    /// Returns `None` unless exactly one of them points in each direction.
    pub fn from_addresses(addresses: impl IntoIterator<Item = u8>) -> Option<Self> {
        let mut input = None;
        let mut output = None;

        for address in addresses.into_iter().take(2) {
            if address & ENDPOINT_DIR_IN != 0 {
                input.get_or_insert(address);
            } else {
                output.get_or_insert(address);
            }
        }

        Some(Self {
            input: input?,
            output: output?,
        })
    }
}

/// An opened USB device, as seen by the accessory driver
///
/// Transfer methods take `&self` so a session's reader thread and the relay
/// thread writing to it can share one handle. Closing happens on drop.
pub trait AccessoryHandle: Send + Sync {
    /// Detach any kernel driver and claim `interface` exclusively
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

/// A freshly enumerated USB device
pub trait UsbDevice: Send {
    type Handle: AccessoryHandle + 'static;

    /// Bus position and vid:pid from the device descriptor
    fn location(&self) -> rusb::Result<UsbLocation>;

    fn open(&self) -> rusb::Result<Self::Handle>;

    /// Bulk endpoints of the first altsetting of the first interface
    fn endpoints(&self) -> rusb::Result<Endpoints>;
}

impl<T: UsbContext + 'static> AccessoryHandle for DeviceHandle<T> {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        if let Ok(true) = self.kernel_driver_active(interface) {
            match self.detach_kernel_driver(interface) {
                Ok(()) => debug!("Detached kernel driver from interface {}", interface),
                Err(e) => warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                ),
            }
        }
        DeviceHandle::claim_interface(self, interface)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }
}

impl<T: UsbContext + 'static> UsbDevice for Device<T> {
    type Handle = DeviceHandle<T>;

    fn location(&self) -> rusb::Result<UsbLocation> {
        let descriptor = self.device_descriptor()?;
        Ok(UsbLocation {
            bus: self.bus_number(),
            address: self.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        })
    }

    fn open(&self) -> rusb::Result<DeviceHandle<T>> {
        Device::open(self)
    }

    fn endpoints(&self) -> rusb::Result<Endpoints> {
        let config = self.active_config_descriptor()?;
        let interface = config.interfaces().next().ok_or(rusb::Error::NotFound)?;
        let setting = interface.descriptors().next().ok_or(rusb::Error::NotFound)?;

        Endpoints::from_addresses(setting.endpoint_descriptors().map(|ep| ep.address()))
            .ok_or(rusb::Error::NotFound)
    }
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filters are `0xVID:0xPID` patterns with `*` wildcards, validated by the
/// config loader. An empty list allows everything.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
    })
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16)
        .map(|v| v == id)
        .unwrap_or(false)
}

/// Whether a device should be probed at all
///
/// Devices already in accessory mode always pass: they are the second half
/// of a mode switch this host started.
pub fn is_probe_candidate(location: &UsbLocation, filters: &[String]) -> bool {
    is_accessory_mode(location.vendor_id, location.product_id)
        || check_filter(location.vendor_id, location.product_id, filters)
}

/// List every device on the bus (for `--list-devices`)
pub fn enumerate<T: UsbContext + 'static>(context: &T) -> rusb::Result<Vec<UsbLocation>> {
    let devices = context.devices()?;
    let mut locations = Vec::new();

    for device in devices.iter() {
        match UsbDevice::location(&device) {
            Ok(location) => locations.push(location),
            Err(e) => warn!(
                "Failed to read descriptor (bus={}, addr={}): {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    locations.sort_by_key(|l| (l.bus, l.address));
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1234:0x5678".to_string(), // Exact match
            "0xABCD:*".to_string(),      // Wildcard PID
        ];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters)); // Wrong PID
        assert!(!check_filter(0x9999, 0x5678, &filters)); // Wrong VID
        assert!(!check_filter(0x0000, 0x0000, &filters));

        // Empty filters = allow all
        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_accessory_mode_bypasses_filters() {
        let filters = vec!["0x04e8:*".to_string()];
        let switched = UsbLocation {
            bus: 1,
            address: 9,
            vendor_id: 0x18d1,
            product_id: 0x2d01,
        };
        let other = UsbLocation {
            vendor_id: 0x0bda,
            product_id: 0x8153,
            ..switched
        };

        assert!(is_probe_candidate(&switched, &filters));
        assert!(!is_probe_candidate(&other, &filters));
    }

    #[test]
    fn test_endpoints_from_addresses() {
        assert_eq!(
            Endpoints::from_addresses([0x81, 0x02]),
            Some(Endpoints {
                input: 0x81,
                output: 0x02
            })
        );
        // Order in the descriptor does not matter
        assert_eq!(
            Endpoints::from_addresses([0x01, 0x83]),
            Some(Endpoints {
                input: 0x83,
                output: 0x01
            })
        );
        // Only the first two are considered
        assert_eq!(Endpoints::from_addresses([0x81, 0x82, 0x02]), None);
        assert_eq!(Endpoints::from_addresses([0x81]), None);
    }

    #[test]
    fn test_default_endpoints() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.input, 0x81);
        assert_eq!(endpoints.output, 0x02);
    }
}
