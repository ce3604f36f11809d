//! Tethering network addressing
//!
//! Every accessory lives at `<subnet>.<id>` inside a single /24. The host
//! octet doubles as the session identifier, so classifying a packet by
//! address is the only routing decision the relay ever makes. Both the
//! session (learning its own identifier from the source address) and the
//! tunnel reader (choosing a target from the destination address) go
//! through [`Subnet::classify`].

use crate::error::{ProtocolError, Result};
use crate::types::SessionId;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Minimum IPv4 header length in bytes
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Offset of the source address in an IPv4 header
const IPV4_SRC_OFFSET: usize = 12;

/// Offset of the destination address in an IPv4 header
const IPV4_DST_OFFSET: usize = 16;

/// Prefix length of the tethering network
pub const PREFIX_LEN: u8 = 24;

const NETWORK_MASK: u32 = u32::MAX << (32 - PREFIX_LEN);

/// Default tethering network
pub const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 0);

/// Nameserver pushed to devices when nothing else is configured
pub const DEFAULT_NAMESERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Which IPv4 header address to classify on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    /// Source address (accessory -> host traffic)
    Source,
    /// Destination address (host -> accessory traffic)
    Destination,
}

impl AddressField {
    fn offset(self) -> usize {
        match self {
            AddressField::Source => IPV4_SRC_OFFSET,
            AddressField::Destination => IPV4_DST_OFFSET,
        }
    }
}

/// A /24 tethering network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Ipv4Addr", into = "Ipv4Addr")]
pub struct Subnet {
    prefix: u32,
}

impl Subnet {
    /// Create a subnet from its network address (host octet must be 0)
    pub fn new(network: Ipv4Addr) -> Result<Self> {
        let bits = u32::from(network);
        if bits & !NETWORK_MASK != 0 {
            return Err(ProtocolError::InvalidSubnet { address: network });
        }
        Ok(Self { prefix: bits })
    }

    /// Network address (`.0`)
    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.prefix)
    }

    /// Address of the host end of the tunnel (`.1`)
    pub fn host_address(&self) -> Ipv4Addr {
        self.address_of(SessionId::HOST)
    }

    /// Address assigned to the accessory holding `id`
    pub fn address_of(&self, id: SessionId) -> Ipv4Addr {
        Ipv4Addr::from(self.prefix | u32::from(id.0))
    }

    /// Whether `addr` falls inside this /24
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & NETWORK_MASK == self.prefix
    }

    /// Classify an IPv4 packet by one of its addresses
    ///
    /// Returns the host octet when the chosen address lies in this subnet.
    /// Non-IPv4 packets, packets shorter than an IPv4 header, foreign
    /// addresses and the `.0` octet all yield `None`. Only the version
    /// nibble and the four address bytes are inspected.
    pub fn classify(&self, packet: &[u8], field: AddressField) -> Option<SessionId> {
        if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
            return None;
        }

        let offset = field.offset();
        let addr = BigEndian::read_u32(&packet[offset..offset + 4]);

        if addr & NETWORK_MASK != self.prefix {
            return None;
        }

        match (addr & 0xff) as u8 {
            0 => None,
            octet => Some(SessionId(octet)),
        }
    }

    /// Build the serial string pushed to a device during the handshake
    ///
    /// The device configures itself from this string: `"<addr>,<nameserver>"`.
    pub fn serial_for(&self, id: SessionId, nameserver: Ipv4Addr) -> String {
        format!("{},{}", self.address_of(id), nameserver)
    }

    /// Parse a serial string back into the identifier and nameserver it carries
    pub fn parse_serial(&self, serial: &str) -> Result<(SessionId, Ipv4Addr)> {
        let malformed = || ProtocolError::MalformedSerial(serial.to_string());

        let (addr, nameserver) = serial.split_once(',').ok_or_else(malformed)?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| malformed())?;
        let nameserver: Ipv4Addr = nameserver.trim().parse().map_err(|_| malformed())?;

        if !self.contains(addr) {
            return Err(ProtocolError::OutsideSubnet {
                address: addr,
                subnet: self.network_address(),
            });
        }

        let id = SessionId(addr.octets()[3]);
        if id.is_reserved() {
            return Err(ProtocolError::ReservedIdentifier(id.0));
        }

        Ok((id, nameserver))
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            prefix: u32::from(DEFAULT_SUBNET),
        }
    }
}

impl TryFrom<Ipv4Addr> for Subnet {
    type Error = ProtocolError;

    fn try_from(addr: Ipv4Addr) -> Result<Self> {
        Subnet::new(addr)
    }
}

impl From<Subnet> for Ipv4Addr {
    fn from(subnet: Subnet) -> Ipv4Addr {
        subnet.network_address()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), PREFIX_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    #[test]
    fn test_default_subnet() {
        let subnet = Subnet::default();
        assert_eq!(subnet.network_address(), Ipv4Addr::new(10, 1, 1, 0));
        assert_eq!(subnet.host_address(), Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(subnet.to_string(), "10.1.1.0/24");
    }

    #[test]
    fn test_subnet_rejects_host_bits() {
        assert!(Subnet::new(Ipv4Addr::new(192, 168, 7, 0)).is_ok());
        assert_eq!(
            Subnet::new(Ipv4Addr::new(10, 1, 1, 5)),
            Err(ProtocolError::InvalidSubnet {
                address: Ipv4Addr::new(10, 1, 1, 5)
            })
        );
    }

    #[test]
    fn test_classify_destination() {
        let subnet = Subnet::default();
        let packet = ipv4_packet([8, 8, 8, 8], [10, 1, 1, 7]);
        assert_eq!(
            subnet.classify(&packet, AddressField::Destination),
            Some(SessionId(7))
        );
        assert_eq!(subnet.classify(&packet, AddressField::Source), None);
    }

    #[test]
    fn test_classify_source() {
        let subnet = Subnet::default();
        let packet = ipv4_packet([10, 1, 1, 42], [1, 1, 1, 1]);
        assert_eq!(
            subnet.classify(&packet, AddressField::Source),
            Some(SessionId(42))
        );
    }

    #[test]
    fn test_classify_rejects_non_ipv4() {
        let subnet = Subnet::default();
        let mut packet = ipv4_packet([10, 1, 1, 3], [10, 1, 1, 3]);
        packet[0] = 0x60;
        assert_eq!(subnet.classify(&packet, AddressField::Source), None);
        assert_eq!(subnet.classify(&packet, AddressField::Destination), None);
    }

    #[test]
    fn test_classify_rejects_truncated() {
        let subnet = Subnet::default();
        let packet = ipv4_packet([10, 1, 1, 3], [10, 1, 1, 3]);
        assert_eq!(subnet.classify(&packet[..19], AddressField::Destination), None);
        assert_eq!(subnet.classify(&[], AddressField::Destination), None);
    }

    #[test]
    fn test_classify_network_octet_is_not_ours() {
        let subnet = Subnet::default();
        let packet = ipv4_packet([10, 1, 1, 0], [10, 1, 1, 0]);
        assert_eq!(subnet.classify(&packet, AddressField::Destination), None);
    }

    #[test]
    fn test_classify_foreign_network() {
        let subnet = Subnet::default();
        let packet = ipv4_packet([10, 1, 2, 7], [10, 1, 2, 7]);
        assert_eq!(subnet.classify(&packet, AddressField::Destination), None);
    }

    #[test]
    fn test_serial_string() {
        let subnet = Subnet::default();
        let serial = subnet.serial_for(SessionId(2), DEFAULT_NAMESERVER);
        assert_eq!(serial, "10.1.1.2,8.8.8.8");
        assert_eq!(
            subnet.parse_serial(&serial),
            Ok((SessionId(2), DEFAULT_NAMESERVER))
        );
    }

    #[test]
    fn test_parse_serial_errors() {
        let subnet = Subnet::default();
        assert!(matches!(
            subnet.parse_serial("10.1.1.2"),
            Err(ProtocolError::MalformedSerial(_))
        ));
        assert!(matches!(
            subnet.parse_serial("10.9.1.2,8.8.8.8"),
            Err(ProtocolError::OutsideSubnet { .. })
        ));
        assert_eq!(
            subnet.parse_serial("10.1.1.255,8.8.8.8"),
            Err(ProtocolError::ReservedIdentifier(255))
        );
    }
}
