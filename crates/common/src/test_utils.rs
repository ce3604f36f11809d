//! Test utilities for rust-simple-rt
//!
//! Packet builders and wait helpers used across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_ipv4_packet;
//! use std::net::Ipv4Addr;
//!
//! # fn main() {
//! let packet = create_ipv4_packet(Ipv4Addr::new(10, 1, 1, 7), Ipv4Addr::new(8, 8, 8, 8), 0);
//! assert_eq!(packet.len(), 20);
//! assert_eq!(packet[0] >> 4, 4);
//! # }
//! ```

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create an IPv4 packet with a minimal header and `payload_len` filler bytes
///
/// Only the fields the relay looks at are meaningful: version/IHL, total
/// length and the two addresses.
pub fn create_ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let total = 20 + payload_len;
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    for (i, byte) in packet[20..].iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
    packet
}

/// Create a minimal IPv6 header (40 bytes, version nibble 6)
pub fn create_ipv6_packet() -> Vec<u8> {
    let mut packet = vec![0u8; 40];
    packet[0] = 0x60;
    packet
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed. Used by tests that drive
/// worker threads and wait for a side effect.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() {
/// let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
/// assert_eq!(result.unwrap(), 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Timeout error for async tests
#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
