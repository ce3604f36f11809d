//! IP relay: the tunnel device and the engine that demultiplexes it

pub mod engine;
pub mod tun;

pub use engine::{RelayEngine, RelaySettings, TunnelExit};
pub use tun::{LinuxTun, MemoryTunnel, TunnelDevice, is_tun_present};
