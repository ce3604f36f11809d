//! Async channel bridge between the Tokio main task and the USB thread
//!
//! The USB event loop, the tunnel reader and every accessory session run on
//! plain OS threads. The main task only talks to them through this bridge:
//! commands go down, lifecycle events come up.

use crate::usb_types::{SessionInfo, SessionKey};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::SessionId;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Commands from the main task to the USB thread
#[derive(Debug)]
pub enum RelayCommand {
    /// Snapshot every live accessory session
    ListSessions {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<SessionInfo>>,
    },

    /// Stop hotplug handling, close all sessions and exit the USB thread
    Shutdown,
}

/// Lifecycle events raised by sessions and the relay engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A session learned its identifier and is relaying
    SessionBound {
        key: SessionKey,
        id: SessionId,
        address: Ipv4Addr,
    },

    /// A session reached its terminal state
    SessionClosed {
        key: SessionKey,
        id: Option<SessionId>,
    },

    /// The tunnel reader stopped; the process can't relay anymore
    TunnelClosed {
        /// Human readable cause
        reason: String,
    },
}

/// Cloneable, non-blocking event emitter handed to worker threads
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<RelayEvent>,
}

impl EventSink {
    /// Emit an informational event without blocking the caller
    ///
    /// A full channel drops the event; the session logs carry the same facts.
    pub fn emit(&self, event: RelayEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event channel closed");
            }
        }
    }

    /// Emit an event that must reach the main task
    pub fn emit_blocking(&self, event: RelayEvent) {
        if let Err(e) = self.tx.send_blocking(event) {
            debug!("Event channel closed: {}", e);
        }
    }

    /// A sink whose events go nowhere
    #[cfg(test)]
    fn detached() -> Self {
        let (tx, _rx) = bounded(1);
        Self { tx }
    }
}

/// Handle for the Tokio main task (async)
#[derive(Clone)]
pub struct RelayBridge {
    cmd_tx: Sender<RelayCommand>,
    event_rx: Receiver<RelayEvent>,
}

impl RelayBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: RelayCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the worker threads
    pub async fn recv_event(&self) -> crate::Result<RelayEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread for the live session list
    pub async fn list_sessions(&self) -> crate::Result<Vec<SessionInfo>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(RelayCommand::ListSessions { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB thread (blocking)
pub struct RelayWorker {
    pub(crate) cmd_rx: Receiver<RelayCommand>,
    event_tx: Sender<RelayEvent>,
}

impl RelayWorker {
    /// Receive a command from the main task (blocking)
    pub fn recv_command(&self) -> crate::Result<RelayCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<RelayCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Event emitter for threads spawned by the worker
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            tx: self.event_tx.clone(),
        }
    }
}

/// Create the channel bridge between the main task and the USB thread
///
/// Returns (RelayBridge for Tokio, RelayWorker for the USB thread)
pub fn create_relay_bridge() -> (RelayBridge, RelayWorker) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let (event_tx, event_rx) = bounded(256);

    (
        RelayBridge { cmd_tx, event_rx },
        RelayWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_relay_bridge();

        // Spawn a thread to simulate the USB worker
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, RelayCommand::Shutdown)
        });

        bridge.send_command(RelayCommand::Shutdown).await.unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_event_sink_reaches_bridge() {
        let (bridge, worker) = create_relay_bridge();
        let sink = worker.event_sink();

        std::thread::spawn(move || {
            sink.emit(RelayEvent::SessionClosed {
                key: SessionKey(3),
                id: None,
            });
        })
        .join()
        .unwrap();

        let event = bridge.recv_event().await.unwrap();
        assert_eq!(
            event,
            RelayEvent::SessionClosed {
                key: SessionKey(3),
                id: None
            }
        );
    }

    #[test]
    fn test_detached_sink_never_blocks() {
        let sink = EventSink::detached();
        for i in 0..10 {
            sink.emit(RelayEvent::SessionClosed {
                key: SessionKey(i),
                id: None,
            });
        }
    }
}
