//! Tether Protocol
//!
//! Defines the data model shared by the bridge crates: session and handle
//! identifiers, the events producers hand to the script thread, host-visible
//! script values, and the status codes reported to hosts.

mod events;
mod status;
mod types;

pub use events::*;
pub use status::*;
pub use types::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;
