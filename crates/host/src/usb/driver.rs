//! Android Open Accessory driver
//!
//! `probe` turns a freshly enumerated device into one of three outcomes:
//! a ready accessory link (device already in accessory mode), a requested
//! mode switch (handshake sent, device will re-enumerate), or "not an
//! accessory". `AccessoryLink` then carries packets over the bulk pair.

use crate::session::table::{IdentifierTable, TableError};
use crate::usb::{AccessoryHandle, Endpoints, UsbDevice};
use common::UsbLocation;
use protocol::aoa::{
    self, ACCESSORY_INTERFACE, REQUEST_GET_PROTOCOL, REQUEST_SEND_STRING, REQUEST_START,
    REQUEST_TYPE_VENDOR_IN, REQUEST_TYPE_VENDOR_OUT,
};
use protocol::{
    AccessoryIdentity, DEFAULT_NAMESERVER, ProtocolError, SessionId, Subnet, is_accessory_mode,
};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bulk transfer timeout; also the cancellation latency of a session
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_millis(200);

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Everything the driver needs besides the device itself
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub subnet: Subnet,
    pub nameserver: Ipv4Addr,
    pub identity: AccessoryIdentity,
    pub control_timeout: Duration,
    pub bulk_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            subnet: Subnet::default(),
            nameserver: DEFAULT_NAMESERVER,
            identity: AccessoryIdentity::default(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
        }
    }
}

/// Probe failures that deserve a log line but never stop the process
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to read device descriptor: {0}")]
    Descriptor(rusb::Error),

    #[error("Failed to open device: {0}")]
    Open(rusb::Error),

    #[error("Failed to claim accessory interface: {0}")]
    Claim(rusb::Error),

    #[error("Unusable AOA protocol reply: {0}")]
    VersionQuery(#[from] ProtocolError),

    #[error(transparent)]
    Identifier(#[from] TableError),

    #[error("Handshake failed sending {step}: {source}")]
    Handshake {
        step: &'static str,
        source: rusb::Error,
    },
}

/// Result of probing one device
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Device is in accessory mode; its interface is claimed
    Session(AccessoryLink),
    /// Handshake sent; the device will come back in accessory mode using `id`
    ModeSwitchRequested(SessionId),
    /// Device does not speak AOA
    NotAnAccessory,
}

/// Probe a device and, when possible, bring it into accessory mode
///
/// The identifier pushed in the serial string is acquired here and handed
/// straight to the handshake. It stays reserved on success so the
/// re-enumerated device can bind it; a handshake failure releases it unless
/// a session bound it in the meantime.
pub fn probe<D, S>(
    device: &D,
    settings: &DriverSettings,
    table: &IdentifierTable<S>,
) -> Result<ProbeOutcome, ProbeError>
where
    D: UsbDevice,
{
    let location = device.location().map_err(ProbeError::Descriptor)?;

    if is_accessory_mode(location.vendor_id, location.product_id) {
        return open_accessory(device, location, settings).map(ProbeOutcome::Session);
    }

    let handle = device.open().map_err(ProbeError::Open)?;

    let mut reply = [0u8; 2];
    let read = match handle.read_control(
        REQUEST_TYPE_VENDOR_IN,
        REQUEST_GET_PROTOCOL,
        0,
        0,
        &mut reply,
        settings.control_timeout,
    ) {
        Ok(read) => read,
        Err(rusb::Error::Pipe) => {
            debug!("{} does not support AOA", location);
            return Ok(ProbeOutcome::NotAnAccessory);
        }
        Err(e) => {
            warn!("AOA protocol query failed on {}: {}", location, e);
            return Ok(ProbeOutcome::NotAnAccessory);
        }
    };
    let version = aoa::decode_protocol_version(&reply[..read])?;

    if version == 0 {
        debug!("{} reports AOA version 0", location);
        return Ok(ProbeOutcome::NotAnAccessory);
    }
    info!("{} supports AOA protocol version {}", location, version);

    let id = table.acquire()?;
    debug!("Reserved identifier {} for {}", id, location);

    if let Err(e) = handshake(&handle, settings, id) {
        if table.release_pending(id) {
            debug!("Released identifier {} after failed handshake", id);
        } else {
            debug!("Identifier {} was bound during the failed handshake, keeping it", id);
        }
        return Err(e);
    }

    info!(
        "{} switching to accessory mode as {}",
        location,
        settings.subnet.address_of(id)
    );
    Ok(ProbeOutcome::ModeSwitchRequested(id))
}

fn open_accessory<D: UsbDevice>(
    device: &D,
    location: UsbLocation,
    settings: &DriverSettings,
) -> Result<AccessoryLink, ProbeError> {
    let mut handle = device.open().map_err(ProbeError::Open)?;
    handle
        .claim_interface(ACCESSORY_INTERFACE)
        .map_err(ProbeError::Claim)?;

    let endpoints = device.endpoints().unwrap_or_else(|e| {
        warn!(
            "Unable to read endpoints of {} ({}), using defaults",
            location, e
        );
        Endpoints::default()
    });

    debug!(
        "Accessory {} endpoints in={:#04x} out={:#04x}",
        location, endpoints.input, endpoints.output
    );

    Ok(AccessoryLink::new(
        handle,
        endpoints,
        location,
        settings.bulk_timeout,
    ))
}

fn handshake<H: AccessoryHandle>(
    handle: &H,
    settings: &DriverSettings,
    id: SessionId,
) -> Result<(), ProbeError> {
    let serial = settings.subnet.serial_for(id, settings.nameserver);

    for (index, value) in settings.identity.strings(&serial) {
        debug!("Sending {} string: {}", index.name(), value);
        handle
            .write_control(
                REQUEST_TYPE_VENDOR_OUT,
                REQUEST_SEND_STRING,
                0,
                index as u16,
                &aoa::encode_string(value),
                settings.control_timeout,
            )
            .map_err(|source| ProbeError::Handshake {
                step: index.name(),
                source,
            })?;
    }

    debug!("Sending start accessory");
    handle
        .write_control(
            REQUEST_TYPE_VENDOR_OUT,
            REQUEST_START,
            0,
            0,
            &[],
            settings.control_timeout,
        )
        .map_err(|source| ProbeError::Handshake {
            step: "start",
            source,
        })?;

    Ok(())
}

/// Bulk packet transport of an accessory-mode device
///
/// The handle sits behind an `RwLock<Option<_>>` held only long enough to
/// clone the `Arc`. `close` takes it out once; the device is closed when the
/// last in-flight transfer drops its clone.
pub struct AccessoryLink {
    handle: RwLock<Option<Arc<dyn AccessoryHandle>>>,
    endpoints: Endpoints,
    location: UsbLocation,
    timeout: Duration,
}

impl AccessoryLink {
    pub fn new(
        handle: impl AccessoryHandle + 'static,
        endpoints: Endpoints,
        location: UsbLocation,
        timeout: Duration,
    ) -> Self {
        let handle: Arc<dyn AccessoryHandle> = Arc::new(handle);
        Self {
            handle: RwLock::new(Some(handle)),
            endpoints,
            location,
            timeout,
        }
    }

    pub fn location(&self) -> UsbLocation {
        self.location
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn is_open(&self) -> bool {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn handle(&self) -> rusb::Result<Arc<dyn AccessoryHandle>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(rusb::Error::NoDevice)
    }

    /// Read one packet from the IN endpoint
    ///
    /// Timeouts and zero-length transfers are retried while `running` holds,
    /// so a cleared flag is noticed within one bulk timeout. Returns
    /// `Ok(None)` once stopped.
    pub fn read_packet(&self, buf: &mut [u8], running: &AtomicBool) -> rusb::Result<Option<usize>> {
        let handle = self.handle()?;

        while running.load(Ordering::Acquire) {
            match handle.read_bulk(self.endpoints.input, buf, self.timeout) {
                Ok(0) | Err(rusb::Error::Timeout) => continue,
                Ok(read) => return Ok(Some(read)),
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Write a whole packet to the OUT endpoint
    ///
    /// Timeouts are retried while `running` holds. Stopping mid-write
    /// reports `Interrupted`.
    pub fn write_packet(&self, data: &[u8], running: &AtomicBool) -> rusb::Result<()> {
        let handle = self.handle()?;
        let mut written = 0;

        while written < data.len() {
            if !running.load(Ordering::Acquire) {
                return Err(rusb::Error::Interrupted);
            }
            match handle.write_bulk(self.endpoints.output, &data[written..], self.timeout) {
                Ok(n) => written += n,
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Release the interface and close the device
    ///
    /// Returns whether this call was the one that closed it.
    pub fn close(&self) -> bool {
        let handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        handle.is_some()
    }
}

impl fmt::Debug for AccessoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessoryLink")
            .field("location", &self.location)
            .field("endpoints", &self.endpoints)
            .field("open", &self.is_open())
            .finish()
    }
}
