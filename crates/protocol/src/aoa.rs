//! Android Open Accessory (AOA) protocol definitions
//!
//! A device is switched into accessory mode with a short control-transfer
//! sequence on endpoint 0:
//!
//! 1. `GET_PROTOCOL` (vendor IN) reads a little-endian `u16` version.
//! 2. `SEND_STRING` (vendor OUT) six times, one NUL-terminated string per
//!    [`StringIndex`], in index order.
//! 3. `START` (vendor OUT, no data) makes the device drop off the bus and
//!    re-enumerate with one of the [`ACCESSORY_PIDS`] under [`GOOGLE_VID`].

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Read the supported AOA protocol version
pub const REQUEST_GET_PROTOCOL: u8 = 51;
/// Send one identification string
pub const REQUEST_SEND_STRING: u8 = 52;
/// Switch the device into accessory mode
pub const REQUEST_START: u8 = 53;

/// bmRequestType for vendor device-to-host requests
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
/// bmRequestType for vendor host-to-device requests
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Google vendor ID used by devices in accessory mode
pub const GOOGLE_VID: u16 = 0x18D1;

/// Accessory
pub const PID_ACCESSORY: u16 = 0x2D00;
/// Accessory + ADB
pub const PID_ACCESSORY_ADB: u16 = 0x2D01;
/// Audio
pub const PID_AUDIO: u16 = 0x2D02;
/// Audio + ADB
pub const PID_AUDIO_ADB: u16 = 0x2D03;
/// Accessory + audio
pub const PID_ACCESSORY_AUDIO: u16 = 0x2D04;
/// Accessory + audio + ADB
pub const PID_ACCESSORY_AUDIO_ADB: u16 = 0x2D05;

/// Product IDs a device reports once it is in accessory mode
pub const ACCESSORY_PIDS: [u16; 6] = [
    PID_ACCESSORY,
    PID_ACCESSORY_ADB,
    PID_AUDIO,
    PID_AUDIO_ADB,
    PID_ACCESSORY_AUDIO,
    PID_ACCESSORY_AUDIO_ADB,
];

/// Interface carrying the accessory bulk endpoints
pub const ACCESSORY_INTERFACE: u8 = 0;

/// Bulk IN endpoint used when the descriptor can't be read
pub const DEFAULT_EP_IN: u8 = 0x81;
/// Bulk OUT endpoint used when the descriptor can't be read
pub const DEFAULT_EP_OUT: u8 = 0x02;

/// Whether a vid/pid pair identifies a device already in accessory mode
pub fn is_accessory_mode(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == GOOGLE_VID && ACCESSORY_PIDS.contains(&product_id)
}

/// Decode the reply to `GET_PROTOCOL`
///
/// Zero means the device does not speak AOA.
pub fn decode_protocol_version(reply: &[u8]) -> Result<u16> {
    if reply.len() < 2 {
        return Err(ProtocolError::BufferTooSmall {
            needed: 2,
            available: reply.len(),
        });
    }
    Ok(LittleEndian::read_u16(reply))
}

/// wIndex values for `SEND_STRING`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StringIndex {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Url = 4,
    Serial = 5,
}

impl StringIndex {
    /// Name used in handshake logs
    pub fn name(self) -> &'static str {
        match self {
            StringIndex::Manufacturer => "manufacturer",
            StringIndex::Model => "model",
            StringIndex::Description => "description",
            StringIndex::Version => "version",
            StringIndex::Url => "url",
            StringIndex::Serial => "serial",
        }
    }
}

/// NUL-terminate a string for `SEND_STRING`
pub fn encode_string(value: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(value.len() + 1);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    data
}

/// Identification strings announced to the device
///
/// The Android side matches the accessory filter on manufacturer and
/// model, so changing them breaks pairing with the stock app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryIdentity {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub url: String,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "Konstantin Menyaev".to_string(),
            model: "SimpleRT".to_string(),
            description: "Simple Reverse Tethering".to_string(),
            version: "1.0".to_string(),
            url: "https://github.com/vvviperrr/SimpleRT".to_string(),
        }
    }
}

impl AccessoryIdentity {
    /// The six strings in the order they must be sent
    pub fn strings<'a>(&'a self, serial: &'a str) -> [(StringIndex, &'a str); 6] {
        [
            (StringIndex::Manufacturer, self.manufacturer.as_str()),
            (StringIndex::Model, self.model.as_str()),
            (StringIndex::Description, self.description.as_str()),
            (StringIndex::Version, self.version.as_str()),
            (StringIndex::Url, self.url.as_str()),
            (StringIndex::Serial, serial),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessory_mode_ids() {
        for pid in ACCESSORY_PIDS {
            assert!(is_accessory_mode(GOOGLE_VID, pid));
        }
        assert!(!is_accessory_mode(GOOGLE_VID, 0x4EE7));
        assert!(!is_accessory_mode(0x04E8, PID_ACCESSORY));
    }

    #[test]
    fn test_decode_protocol_version() {
        assert_eq!(decode_protocol_version(&[2, 0]), Ok(2));
        assert_eq!(decode_protocol_version(&[0, 0]), Ok(0));
        assert_eq!(decode_protocol_version(&[0x01, 0x01]), Ok(0x0101));
        assert!(decode_protocol_version(&[1]).is_err());
    }

    #[test]
    fn test_request_types() {
        // Bit 7 = 1 means IN (device to host)
        assert_ne!(REQUEST_TYPE_VENDOR_IN & 0x80, 0);
        assert_eq!(REQUEST_TYPE_VENDOR_OUT & 0x80, 0);
        // Vendor type bits (5..6) = 0b10
        assert_eq!(REQUEST_TYPE_VENDOR_IN & 0x60, 0x40);
        assert_eq!(REQUEST_TYPE_VENDOR_OUT & 0x60, 0x40);
    }

    #[test]
    fn test_encode_string_is_nul_terminated() {
        assert_eq!(encode_string("1.0"), b"1.0\0".to_vec());
        assert_eq!(encode_string(""), vec![0]);
    }

    #[test]
    fn test_identity_order() {
        let identity = AccessoryIdentity::default();
        let strings = identity.strings("10.1.1.2,8.8.8.8");
        let indices: Vec<u16> = strings.iter().map(|(idx, _)| *idx as u16).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(strings[5].1, "10.1.1.2,8.8.8.8");
        assert_eq!(strings[1].1, "SimpleRT");
    }
}
