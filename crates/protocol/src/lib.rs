//! Protocol library for rust-simple-rt
//!
//! This crate defines the wire-level conventions shared by the host relay
//! and the Android accessory: the tethering /24 and its per-accessory host
//! octets, the packet classifier that maps IPv4 traffic to sessions, the
//! serial string that tells a device which address to take, and the
//! Android Open Accessory control-transfer constants.
//!
//! Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{AddressField, SessionId, Subnet, DEFAULT_NAMESERVER};
//!
//! let subnet = Subnet::default();
//! let serial = subnet.serial_for(SessionId(7), DEFAULT_NAMESERVER);
//! assert_eq!(serial, "10.1.1.7,8.8.8.8");
//!
//! // A packet from that accessory classifies back to its identifier
//! let mut packet = [0u8; 20];
//! packet[0] = 0x45;
//! packet[12..16].copy_from_slice(&[10, 1, 1, 7]);
//! assert_eq!(subnet.classify(&packet, AddressField::Source), Some(SessionId(7)));
//! ```

pub mod addressing;
pub mod aoa;
pub mod error;
pub mod types;

pub use addressing::{
    AddressField, DEFAULT_NAMESERVER, DEFAULT_SUBNET, IPV4_MIN_HEADER_LEN, PREFIX_LEN, Subnet,
};
pub use aoa::{AccessoryIdentity, StringIndex, is_accessory_mode};
pub use error::{ProtocolError, Result};
pub use types::SessionId;
