//! Accessory session descriptions shared between the USB thread and the main task

use protocol::SessionId;
use std::fmt;
use std::net::Ipv4Addr;

/// Process-unique key of an accessory session
///
/// Unlike [`SessionId`], which is only known once the accessory has spoken
/// and is recycled after close, a key names one session for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acc-{}", self.0)
    }
}

/// Where a USB device sits on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbLocation {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for UsbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} device {:03})",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

/// Accessory session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open, waiting for the first packet to reveal the identifier
    Handshaking,
    /// Identifier assigned, relaying traffic
    Bound,
    /// Terminal; resources released
    Closed,
}

/// Snapshot of a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub location: UsbLocation,
    pub state: SessionState,
    pub id: Option<SessionId>,
    pub address: Option<Ipv4Addr>,
}
