//! Accessory session
//!
//! One session per accessory-mode device, driven on its own thread:
//!
//! ```text
//! Handshaking --first packet with a subnet source--> Bound --error/stop--> Closed
//!      |                                                                     ^
//!      +------------------------- read error / stop ------------------------+
//! ```
//!
//! Every exit edge funnels into [`AccessorySession::close`], which runs its
//! cleanup exactly once.

use crate::session::table::{IdentifierTable, TableError};
use crate::usb::AccessoryLink;
use common::{EventSink, RelayEvent, SessionInfo, SessionKey, SessionState, UsbLocation};
use protocol::{AddressField, SessionId, Subnet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, info, trace, warn};

/// Identifier table binding accessory sessions
pub type SessionTable = IdentifierTable<AccessorySession>;

/// Where bound sessions deliver packets read from their device
pub trait PacketSink: Send + Sync {
    fn forward_from_accessory(&self, packet: &[u8]) -> io::Result<()>;
}

/// Shared collaborators every session is built with
#[derive(Clone)]
pub struct SessionContext {
    pub table: Arc<SessionTable>,
    pub sink: Arc<dyn PacketSink>,
    pub events: EventSink,
    pub subnet: Subnet,
    pub buffer_size: usize,
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseReason {
    /// Running flag cleared
    Stopped,
    UsbRead(rusb::Error),
    TunnelWrite(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::UsbRead(e) => write!(f, "USB read failed: {}", e),
            CloseReason::TunnelWrite(e) => write!(f, "tunnel write failed: {}", e),
        }
    }
}

/// Identifier octet meaning "not bound yet" (the network octet is never assignable)
const UNBOUND: u8 = SessionId::NETWORK.0;

pub struct AccessorySession {
    key: SessionKey,
    link: AccessoryLink,
    id: AtomicU8,
    running: AtomicBool,
    closed: AtomicBool,
    context: SessionContext,
}

impl AccessorySession {
    pub fn new(key: SessionKey, link: AccessoryLink, context: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            key,
            link,
            id: AtomicU8::new(UNBOUND),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            context,
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn location(&self) -> UsbLocation {
        self.link.location()
    }

    pub fn id(&self) -> Option<SessionId> {
        match self.id.load(Ordering::Acquire) {
            UNBOUND => None,
            octet => Some(SessionId(octet)),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.id().is_some() {
            SessionState::Bound
        } else {
            SessionState::Handshaking
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        let id = self.id();
        SessionInfo {
            key: self.key,
            location: self.location(),
            state: self.state(),
            id,
            address: id.map(|id| self.context.subnet.address_of(id)),
        }
    }

    /// Drive the session until it closes
    ///
    /// Blocks the calling thread. Returns after cleanup has run.
    pub fn run(self: &Arc<Self>) {
        info!("{} connected at {}", self.key, self.location());

        let mut buf = vec![0u8; self.context.buffer_size];
        let reason = self.relay(&mut buf);
        self.close(&reason);
    }

    fn relay(self: &Arc<Self>, buf: &mut [u8]) -> CloseReason {
        // Handshaking: the first packet sourced from the subnet names us
        loop {
            match self.link.read_packet(buf, &self.running) {
                Ok(Some(read)) => {
                    let packet = &buf[..read];
                    match self.context.subnet.classify(packet, AddressField::Source) {
                        Some(id) => match self.bind(id) {
                            Ok(()) => {
                                if let Err(e) = self.context.sink.forward_from_accessory(packet) {
                                    return CloseReason::TunnelWrite(e);
                                }
                                break;
                            }
                            Err(e) => warn!("{} discarding packet: {}", self.key, e),
                        },
                        None => trace!("{} discarding unclassified packet", self.key),
                    }
                }
                Ok(None) => return CloseReason::Stopped,
                Err(e) => return CloseReason::UsbRead(e),
            }
        }

        // Bound: forward everything verbatim
        loop {
            match self.link.read_packet(buf, &self.running) {
                Ok(Some(read)) => {
                    if let Err(e) = self.context.sink.forward_from_accessory(&buf[..read]) {
                        return CloseReason::TunnelWrite(e);
                    }
                }
                Ok(None) => return CloseReason::Stopped,
                Err(e) => return CloseReason::UsbRead(e),
            }
        }
    }

    fn bind(self: &Arc<Self>, id: SessionId) -> Result<(), TableError> {
        self.context.table.store(id, self)?;
        self.id.store(id.0, Ordering::Release);

        // Lost a race with close: give the slot back
        if self.closed.load(Ordering::Acquire) {
            self.context.table.release_session(id, self);
            return Ok(());
        }

        let address = self.context.subnet.address_of(id);
        info!("{} bound to {} ({})", self.key, address, id);
        self.context.events.emit(RelayEvent::SessionBound {
            key: self.key,
            id,
            address,
        });
        Ok(())
    }

    /// Ask the session to stop; noticed within one bulk timeout
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Finalizer shared by every exit path
    ///
    /// Only the first call releases the identifier and closes the device.
    pub fn close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        let id = self.id();
        if let Some(id) = id
            && self.context.table.release_session(id, self)
        {
            debug!("Released identifier {}", id);
        }

        if self.link.close() {
            debug!("Closed accessory device {}", self.location());
        }

        match reason {
            CloseReason::Stopped => info!("{} closed", self.key),
            _ => info!("{} closed: {}", self.key, reason),
        }
        self.context
            .events
            .emit(RelayEvent::SessionClosed { key: self.key, id });
    }

    /// Write a packet to the device
    ///
    /// A failure means the accessory went away. It is logged and dropped;
    /// the session's own reader notices the disconnect and closes.
    pub fn send(&self, packet: &[u8]) -> bool {
        match self.link.write_packet(packet, &self.running) {
            Ok(()) => true,
            Err(e) => {
                debug!("{} write failed, dropping packet: {}", self.key, e);
                false
            }
        }
    }
}

impl SessionTable {
    /// Write-path entry of the relay: deliver `packet` to the session bound to `id`
    ///
    /// Returns whether a session took the packet. A missing session is not an
    /// error; the packet is dropped.
    pub fn send(&self, packet: &[u8], id: SessionId) -> bool {
        match self.find(id) {
            Some(session) => session.send(packet),
            None => {
                trace!("No session for {}, dropping packet", id);
                false
            }
        }
    }
}

impl fmt::Debug for AccessorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorySession")
            .field("key", &self.key)
            .field("id", &self.id())
            .field("state", &self.state())
            .field("link", &self.link)
            .finish()
    }
}
