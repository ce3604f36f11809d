//! simple-rt host
//!
//! Reverse tethering for Android phones over USB: devices are switched into
//! accessory mode, each is handed an address in a private /24, and IPv4
//! packets are relayed between the phones and a local TUN interface.

pub mod config;
pub mod hotplug;
pub mod iface;
pub mod lock;
pub mod relay;
pub mod resolver;
pub mod session;
pub mod usb;
pub mod worker;

pub use config::HostConfig;
pub use hotplug::{Dispatcher, HotplugHandler, SessionSupervisor};
pub use relay::{RelayEngine, RelaySettings};
pub use session::{AccessorySession, SessionContext, SessionTable};
pub use worker::{UsbWorkerThread, WorkerError, spawn_usb_worker};
