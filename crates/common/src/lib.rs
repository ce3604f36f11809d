//! Common utilities for rust-simple-rt
//!
//! This crate provides shared functionality for the host relay: error
//! handling, logging setup, descriptions of accessory sessions, and the
//! async channel bridge between the Tokio main task and the blocking USB
//! threads.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    EventSink, RelayBridge, RelayCommand, RelayEvent, RelayWorker, create_relay_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{SessionInfo, SessionKey, SessionState, UsbLocation};
