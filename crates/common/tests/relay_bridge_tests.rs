//! Relay Bridge Integration Tests
//!
//! Tests for the async channel bridge between the Tokio main task and the
//! blocking USB thread.
//!
//! # Test Scenarios
//! - Command flow from the main task to the USB thread
//! - Lifecycle events from session threads back to the main task
//! - Shutdown signalling
//! - Event ordering from a single producer
//!
//! Run with: `cargo test -p common --test relay_bridge_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{
    RelayCommand, RelayEvent, SessionInfo, SessionKey, SessionState, UsbLocation,
    create_relay_bridge,
};
use protocol::SessionId;
use std::net::Ipv4Addr;
use std::thread;

fn sample_info(key: u64, id: u8) -> SessionInfo {
    SessionInfo {
        key: SessionKey(key),
        location: UsbLocation {
            bus: 1,
            address: 4,
            vendor_id: 0x18d1,
            product_id: 0x2d01,
        },
        state: SessionState::Bound,
        id: Some(SessionId(id)),
        address: Some(Ipv4Addr::new(10, 1, 1, id)),
    }
}

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_list_sessions_round_trip() {
    let (bridge, worker) = create_relay_bridge();

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("Failed to receive command");
        if let RelayCommand::ListSessions { response } = cmd {
            response
                .send(vec![sample_info(1, 2), sample_info(2, 3)])
                .expect("Failed to send response");
            true
        } else {
            false
        }
    });

    let sessions = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.list_sessions())
        .await
        .expect("timed out")
        .expect("list failed");

    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, Some(SessionId(2)));
    assert_eq!(sessions[1].address, Some(Ipv4Addr::new(10, 1, 1, 3)));
    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_list_sessions_fails_when_worker_drops_response() {
    let (bridge, worker) = create_relay_bridge();

    let handle = thread::spawn(move || {
        // Receive and drop without answering
        let _ = worker.recv_command();
    });

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.list_sessions())
        .await
        .expect("timed out");
    assert!(result.is_err());
    handle.join().unwrap();
}

#[tokio::test]
async fn test_send_fails_after_worker_dropped() {
    let (bridge, worker) = create_relay_bridge();
    drop(worker);

    assert!(bridge.send_command(RelayCommand::Shutdown).await.is_err());
}

#[test]
fn test_try_recv_command_is_non_blocking() {
    let (_bridge, worker) = create_relay_bridge();
    assert!(worker.try_recv_command().is_none());
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, worker) = create_relay_bridge();
    let sink = worker.event_sink();

    thread::spawn(move || {
        sink.emit(RelayEvent::SessionBound {
            key: SessionKey(9),
            id: SessionId(7),
            address: Ipv4Addr::new(10, 1, 1, 7),
        });
        sink.emit(RelayEvent::SessionClosed {
            key: SessionKey(9),
            id: Some(SessionId(7)),
        });
    })
    .join()
    .unwrap();

    let first = bridge.recv_event().await.unwrap();
    let second = bridge.recv_event().await.unwrap();

    assert!(matches!(first, RelayEvent::SessionBound { id: SessionId(7), .. }));
    assert_eq!(
        second,
        RelayEvent::SessionClosed {
            key: SessionKey(9),
            id: Some(SessionId(7)),
        }
    );
}

#[tokio::test]
async fn test_tunnel_closed_is_delivered_blocking() {
    let (bridge, worker) = create_relay_bridge();
    let sink = worker.event_sink();

    thread::spawn(move || {
        sink.emit_blocking(RelayEvent::TunnelClosed {
            reason: "read failed".to_string(),
        });
    });

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .expect("timed out")
        .unwrap();
    assert!(matches!(event, RelayEvent::TunnelClosed { .. }));
}

#[tokio::test]
async fn test_many_session_threads_share_one_sink() {
    let (bridge, worker) = create_relay_bridge();

    let threads: Vec<_> = (0..8u64)
        .map(|i| {
            let sink = worker.event_sink();
            thread::spawn(move || {
                sink.emit(RelayEvent::SessionClosed {
                    key: SessionKey(i),
                    id: None,
                });
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let mut keys = Vec::new();
    for _ in 0..8 {
        if let RelayEvent::SessionClosed { key, .. } = bridge.recv_event().await.unwrap() {
            keys.push(key.0);
        }
    }
    keys.sort_unstable();
    assert_eq!(keys, (0..8).collect::<Vec<_>>());
}
