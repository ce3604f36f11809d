//! Accessory sessions and the identifier table they bind into

pub mod accessory;
pub mod table;

pub use accessory::{
    AccessorySession, CloseReason, PacketSink, SessionContext, SessionTable,
};
pub use table::{IdentifierTable, TableError};
