//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Subnet base address does not describe a /24 network
    #[error("Invalid subnet {address}: host octet must be 0")]
    InvalidSubnet { address: std::net::Ipv4Addr },

    /// Identifier is one of the reserved octets (network, host, broadcast)
    #[error("Session identifier {0} is reserved")]
    ReservedIdentifier(u8),

    /// Serial string did not have the `<addr>,<nameserver>` shape
    #[error("Malformed serial string: {0}")]
    MalformedSerial(String),

    /// Serial string address lies outside the configured subnet
    #[error("Address {address} is outside subnet {subnet}")]
    OutsideSubnet {
        address: std::net::Ipv4Addr,
        subnet: std::net::Ipv4Addr,
    },

    /// Reply to the AOA protocol query was too short to hold a version
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidSubnet {
            address: Ipv4Addr::new(10, 1, 1, 7),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid subnet"));
        assert!(msg.contains("10.1.1.7"));
    }

    #[test]
    fn test_buffer_too_small_error() {
        let err = ProtocolError::BufferTooSmall {
            needed: 2,
            available: 1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("needed 2"));
    }
}
