//! Tether Script Host
//!
//! Lua 5.4 sessions for untrusted scripts, the capability adapters that
//! expose native services to them, and a runtime that gives every session
//! its own thread.
//!
//! ## Script API
//!
//! - `print(...)`, `info(...)`, `warn(...)`, `printerror(...)` - Console output
//! - `crypt.*` - Hashes, HMAC, base64/hex, random bytes
//! - `http.get(url)`, `http.post(url, body, type)`, `request{...}` - Blocking HTTP
//! - `WebSocket.connect(url)` - Client connections with message callbacks
//! - `Drawing.new(kind)` - Drawing objects presented by the render thread
//! - `timer.after(sec, fn)`, `timer.every(sec, fn)`, `timer.cancel(id)` - Timers
//! - `store.get/set/delete/keys/flush` - Persistent key-value state
//!
//! Native functions report failures as `nil, message`.

mod bindings;
pub mod capabilities;
mod capability;
mod compile;
mod runtime;
mod worker;

pub use bindings::*;
pub use capability::*;
pub use compile::*;
pub use runtime::*;
pub use worker::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tether_engine_core::http::HttpConfig;
use tether_engine_core::render::{Vec2, DEFAULT_SCREEN_SIZE};
use tether_engine_core::{QueueConfig, RegistryError};
use tether_policy::{LimitExceeded, Limits, NetworkPolicy};
use tether_protocol::{ExecReport, Handle, LimitKind, Rejection, SessionId, StatusCode};
use thiserror::Error;

/// Errors returned by sessions and the runtime
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Source rejected: {0}")]
    Rejected(Rejection),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Execution limit exceeded ({kind}): {detail}")]
    LimitExceeded { kind: LimitKind, detail: String },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Session {0} is closed or unknown")]
    InvalidSession(SessionId),

    #[error("Session is busy")]
    SessionBusy,

    #[error("Session initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid handle {0}")]
    InvalidHandle(Handle),

    #[error("Handle {0} was already released")]
    AlreadyReleased(Handle),
}

impl BridgeError {
    /// Status code reported to hosts
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Compile(_) | Self::Rejected(_) => StatusCode::CompileError,
            Self::Runtime(_) => StatusCode::RuntimeError,
            Self::LimitExceeded { .. } => StatusCode::LimitExceeded,
            Self::Cancelled => StatusCode::Cancelled,
            Self::InvalidSession(_) => StatusCode::InvalidSession,
            Self::SessionBusy => StatusCode::SessionBusy,
            Self::InitFailed(_) => StatusCode::InitFailed,
            Self::InvalidHandle(_) => StatusCode::InvalidHandle,
            Self::AlreadyReleased(_) => StatusCode::AlreadyReleased,
        }
    }

    pub fn report(&self) -> ExecReport {
        ExecReport::failed(self.status(), self.to_string())
    }

    fn from_registry(error: RegistryError, session: SessionId) -> Self {
        match error {
            RegistryError::InvalidHandle(h) => Self::InvalidHandle(h),
            RegistryError::AlreadyReleased(h) => Self::AlreadyReleased(h),
            RegistryError::Closed => Self::InvalidSession(session),
            RegistryError::Exhausted => Self::Runtime("handle registry is full".into()),
        }
    }
}

impl From<LimitExceeded> for BridgeError {
    fn from(e: LimitExceeded) -> Self {
        match e.kind {
            LimitKind::Cancelled => Self::Cancelled,
            kind => Self::LimitExceeded {
                kind,
                detail: e.detail,
            },
        }
    }
}

/// Status-code view of any bridge result
pub fn report_of<T>(result: &Result<T, BridgeError>) -> ExecReport {
    match result {
        Ok(_) => ExecReport::ok(),
        Err(e) => e.report(),
    }
}

/// Which bundled capabilities a session installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySet {
    pub console: bool,
    pub crypto: bool,
    pub http: bool,
    pub websocket: bool,
    pub drawing: bool,
    pub timers: bool,
    pub store: bool,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all()
    }
}

impl CapabilitySet {
    pub fn all() -> Self {
        Self {
            console: true,
            crypto: true,
            http: true,
            websocket: true,
            drawing: true,
            timers: true,
            store: true,
        }
    }

    /// Nothing bundled; hosts add their own capabilities
    pub fn none() -> Self {
        Self {
            console: false,
            crypto: false,
            http: false,
            websocket: false,
            drawing: false,
            timers: false,
            store: false,
        }
    }
}

/// Configuration for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub limits: Limits,
    pub network: NetworkPolicy,
    /// Queue settings applied to every asynchronous adapter
    pub queue: QueueConfig,
    pub http: HttpConfig,
    /// Directory the store file and `compile_file` paths resolve against
    pub workspace_root: PathBuf,
    /// Store file, relative to `workspace_root`
    pub store_file: String,
    /// Render thread frequency in frames per second
    pub render_hz: u32,
    pub screen_size: Vec2,
    /// WebSocket connect and handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    pub capabilities: CapabilitySet,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            network: NetworkPolicy::default(),
            queue: QueueConfig::default(),
            http: HttpConfig::default(),
            workspace_root: PathBuf::from("."),
            store_file: "store.json".into(),
            render_hz: 60,
            screen_size: DEFAULT_SCREEN_SIZE,
            connect_timeout_ms: 10_000,
            capabilities: CapabilitySet::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.render_hz, 60);
        assert_eq!(config.store_file, "store.json");
        assert_eq!(config.capabilities, CapabilitySet::all());
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn partial_config_json() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"render_hz": 30, "capabilities": {"http": false}, "limits": {"max_instructions": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.render_hz, 30);
        assert!(!config.capabilities.http);
        assert!(config.capabilities.console);
        assert_eq!(config.limits.max_instructions, Some(1000));
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(BridgeError::SessionBusy.status(), StatusCode::SessionBusy);
        assert_eq!(
            BridgeError::from(LimitExceeded::new(LimitKind::Cancelled, "host")),
            BridgeError::Cancelled
        );
        let err = BridgeError::from(LimitExceeded::new(LimitKind::Memory, "too much"));
        assert_eq!(err.status(), StatusCode::LimitExceeded);
        assert_eq!(err.report().status, StatusCode::LimitExceeded);
        assert!(report_of::<()>(&Ok(())).status.is_ok());
    }
}
