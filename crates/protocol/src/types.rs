//! Session identifier type
//!
//! A session identifier is the host octet of an accessory's IPv4 address
//! inside the tethering /24. It names exactly one live accessory session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an accessory session (host octet of its address)
///
/// Values 0, 1 and 255 are permanently reserved: they are the network,
/// host and broadcast octets of the /24. Every other value may be
/// assigned to at most one live session at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u8);

impl SessionId {
    /// Network address octet
    pub const NETWORK: SessionId = SessionId(0);
    /// Host (tunnel endpoint) octet
    pub const HOST: SessionId = SessionId(1);
    /// Broadcast octet
    pub const BROADCAST: SessionId = SessionId(255);

    /// All reserved identifiers
    pub const RESERVED: [SessionId; 3] = [Self::NETWORK, Self::HOST, Self::BROADCAST];

    /// Number of identifiers that can be handed out concurrently
    pub const ASSIGNABLE: usize = 256 - Self::RESERVED.len();

    /// Whether this identifier is one of the reserved octets
    pub fn is_reserved(self) -> bool {
        Self::RESERVED.contains(&self)
    }

    /// Iterate over every assignable identifier, lowest first
    pub fn assignable() -> impl Iterator<Item = SessionId> {
        (0..=u8::MAX).map(SessionId).filter(|id| !id.is_reserved())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<SessionId> for u8 {
    fn from(id: SessionId) -> u8 {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_identifiers() {
        assert!(SessionId(0).is_reserved());
        assert!(SessionId(1).is_reserved());
        assert!(SessionId(255).is_reserved());
        assert!(!SessionId(2).is_reserved());
        assert!(!SessionId(254).is_reserved());
    }

    #[test]
    fn test_assignable_count() {
        assert_eq!(SessionId::ASSIGNABLE, 253);
        assert_eq!(SessionId::assignable().count(), SessionId::ASSIGNABLE);
        assert_eq!(SessionId::assignable().next(), Some(SessionId(2)));
        assert_eq!(SessionId::assignable().last(), Some(SessionId(254)));
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionId(7).to_string(), "#7");
    }
}
