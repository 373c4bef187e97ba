//! Tether Engine Core
//!
//! This crate provides the interpreter-agnostic plumbing behind every
//! script capability:
//! - Bounded event queues between producer threads and the session thread
//! - The generation-tagged handle registry
//! - Adapter lifecycle and producer thread management
//! - Timer, render and WebSocket receiver threads
//! - Blocking HTTP, crypto helpers and the key-value store

pub mod adapter;
pub mod crypto;
pub mod http;
pub mod net;
mod registry;
pub mod render;
mod store;
mod sync;
pub mod timer;
mod transport;

pub use adapter::{AdapterLifecycle, AdapterState, ProducerSet, JOIN_TIMEOUT};
pub use registry::*;
pub use store::*;
pub use sync::*;
pub use transport::*;
