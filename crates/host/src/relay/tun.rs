//! Tunnel devices
//!
//! The relay reads and writes whole IPv4 packets through [`TunnelDevice`].
//! `LinuxTun` is the real `/dev/net/tun` interface; `MemoryTunnel` is an
//! in-memory stand-in for tests.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

/// TUN clone device
pub const TUN_PATH: &str = "/dev/net/tun";

const IFNAMSIZ: usize = 16;
const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;

/// Interface request structure
#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

nix::ioctl_write_int!(tun_set_iff, b'T', 202);

/// A packet-oriented virtual network interface
pub trait TunnelDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Read one packet, waiting at most `timeout`
    ///
    /// `Ok(None)` means nothing arrived in time; `Ok(Some(0))` is end of file.
    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Write one whole packet
    fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Whether the kernel offers TUN devices
pub fn is_tun_present() -> bool {
    Path::new(TUN_PATH).exists()
}

/// Linux TUN device (`IFF_TUN | IFF_NO_PI`)
///
/// Reads and writes go through `&File`, so the relay thread and every
/// session thread share one descriptor. The kernel writes each packet
/// atomically.
pub struct LinuxTun {
    file: File,
    name: String,
}

impl LinuxTun {
    /// Allocate a TUN interface; the kernel picks the name when `name` is `None`
    pub fn open(name: Option<&str>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;

        let mut request = IfReq {
            name: [0; IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        if let Some(name) = name {
            for (slot, byte) in request.name.iter_mut().zip(name.bytes().take(IFNAMSIZ - 1)) {
                *slot = byte;
            }
        }

        // SAFETY: `request` is a live, properly laid out ifreq for the whole call
        unsafe {
            tun_set_iff(
                file.as_raw_fd(),
                &mut request as *mut IfReq as nix::sys::ioctl::ioctl_param_type,
            )
        }
        .map_err(io::Error::from)?;

        let len = request
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IFNAMSIZ);
        let name = String::from_utf8_lossy(&request.name[..len]).into_owned();

        info!("Created TUN device: {}", name);
        Ok(Self { file, name })
    }
}

impl TunnelDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];

        let ready = poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }

        (&self.file).read(buf).map(Some)
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        (&self.file).write(packet)
    }
}

/// In-memory tunnel recording every written packet
#[derive(Debug, Default)]
pub struct MemoryTunnel {
    inbound: Mutex<VecDeque<io::Result<Vec<u8>>>>,
    written: Mutex<Vec<Vec<u8>>>,
    eof: AtomicBool,
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet for the relay to read
    pub fn inject(&self, packet: Vec<u8>) {
        lock(&self.inbound).push_back(Ok(packet));
    }

    /// Queue a read failure
    pub fn inject_error(&self, kind: io::ErrorKind) {
        lock(&self.inbound).push_back(Err(io::Error::from(kind)));
    }

    /// Report end of file once the queue drains
    pub fn close(&self) {
        self.eof.store(true, Ordering::Release);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }
}

impl TunnelDevice for MemoryTunnel {
    fn name(&self) -> &str {
        "memtun0"
    }

    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let next = lock(&self.inbound).pop_front();
        match next {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(Some(len))
            }
            Some(Err(e)) => Err(e),
            None if self.eof.load(Ordering::Acquire) => Ok(Some(0)),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(None)
            }
        }
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        lock(&self.written).push(packet.to_vec());
        Ok(packet.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout() {
        // struct ifreq is 40 bytes on Linux
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn test_memory_tunnel_read_order() {
        let tun = MemoryTunnel::new();
        tun.inject(vec![1, 2, 3]);
        tun.inject(vec![4]);

        let mut buf = [0u8; 16];
        let timeout = Duration::from_millis(1);
        assert_eq!(tun.read_packet(&mut buf, timeout).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(tun.read_packet(&mut buf, timeout).unwrap(), Some(1));
        assert_eq!(tun.read_packet(&mut buf, timeout).unwrap(), None);

        tun.close();
        assert_eq!(tun.read_packet(&mut buf, timeout).unwrap(), Some(0));
    }

    #[test]
    fn test_memory_tunnel_write_failure() {
        let tun = MemoryTunnel::new();
        tun.write_packet(&[1]).unwrap();
        tun.fail_writes(true);
        assert!(tun.write_packet(&[2]).is_err());
        assert_eq!(tun.written(), vec![vec![1]]);
    }
}
