//! IP relay engine
//!
//! Owns the tunnel. Its reader thread classifies every packet by
//! destination and hands it to the bound session; sessions push their
//! device's packets back through [`PacketSink`].

use crate::relay::tun::TunnelDevice;
use crate::session::{PacketSink, SessionTable};
use common::{EventSink, RelayEvent};
use protocol::{AddressField, SessionId, Subnet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, trace};

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub subnet: Subnet,
    /// Longest a tunnel read blocks before the running flag is rechecked
    pub poll_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            subnet: Subnet::default(),
            poll_timeout: Duration::from_millis(200),
            buffer_size: 4096,
        }
    }
}

/// How the reader loop ended
#[derive(Debug)]
pub enum TunnelExit {
    Stopped,
    EndOfFile,
    ReadFailed(io::Error),
}

pub struct RelayEngine {
    tunnel: Arc<dyn TunnelDevice>,
    table: Arc<SessionTable>,
    settings: RelaySettings,
    running: AtomicBool,
}

impl RelayEngine {
    pub fn new(
        tunnel: Arc<dyn TunnelDevice>,
        table: Arc<SessionTable>,
        settings: RelaySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel,
            table,
            settings,
            running: AtomicBool::new(true),
        })
    }

    pub fn tunnel_name(&self) -> &str {
        self.tunnel.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Session a tunnel packet is addressed to
    pub fn route(&self, packet: &[u8]) -> Option<SessionId> {
        self.settings
            .subnet
            .classify(packet, AddressField::Destination)
    }

    /// Forward one tunnel packet to its session
    ///
    /// Returns whether a session accepted it. Anything unroutable is dropped.
    pub fn dispatch(&self, packet: &[u8]) -> bool {
        match self.route(packet) {
            Some(id) => self.table.send(packet, id),
            None => {
                trace!("Dropping unroutable packet ({} bytes)", packet.len());
                false
            }
        }
    }

    /// Tunnel read loop; returns when stopped, at end of file, or on a read error
    pub fn run(&self) -> TunnelExit {
        let mut buf = vec![0u8; self.settings.buffer_size];

        let exit = loop {
            if !self.running.load(Ordering::Acquire) {
                break TunnelExit::Stopped;
            }
            match self.tunnel.read_packet(&mut buf, self.settings.poll_timeout) {
                Ok(None) => continue,
                Ok(Some(0)) => break TunnelExit::EndOfFile,
                Ok(Some(read)) => {
                    self.dispatch(&buf[..read]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break TunnelExit::ReadFailed(e),
            }
        };

        self.running.store(false, Ordering::Release);
        exit
    }

    /// Run the read loop on its own thread
    ///
    /// Any exit other than [`stop`](Self::stop) is reported as
    /// `TunnelClosed`, which ends the process.
    pub fn spawn(self: &Arc<Self>, events: EventSink) -> io::Result<JoinHandle<()>> {
        let engine = self.clone();

        std::thread::Builder::new()
            .name("tun-reader".to_string())
            .spawn(move || {
                info!("Relaying on {}", engine.tunnel_name());
                let reason = match engine.run() {
                    TunnelExit::Stopped => {
                        info!("Tunnel reader stopped");
                        return;
                    }
                    TunnelExit::EndOfFile => "end of file".to_string(),
                    TunnelExit::ReadFailed(e) => format!("read failed: {}", e),
                };
                error!("Tunnel {} closed: {}", engine.tunnel_name(), reason);
                events.emit_blocking(RelayEvent::TunnelClosed { reason });
            })
    }

    /// Stop the read loop within one poll timeout
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl PacketSink for RelayEngine {
    fn forward_from_accessory(&self, packet: &[u8]) -> io::Result<()> {
        let written = self.tunnel.write_packet(packet)?;
        if written != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short tunnel write: {} of {} bytes", written, packet.len()),
            ));
        }
        Ok(())
    }
}
