//! Events (producer thread → session thread)

use serde::{Deserialize, Serialize};

use crate::Handle;

/// A unit of data handed from a producer thread to the session thread.
///
/// Producers push events into their adapter's queue; the session drains the
/// queue between script turns and dispatches each event to the callbacks
/// its adapter routes it to. Order is guaranteed per queue only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Data received by a producer
    Message { source: Handle, payload: Vec<u8> },

    /// The producer has stopped; nothing from `source` follows this event
    Close { source: Handle },

    /// The producer hit a failure it could report
    Error { source: Handle, detail: String },

    /// A timer registered under `source` expired
    Fire { source: Handle },

    /// A render frame was presented
    Tick,
}

impl Event {
    #[must_use]
    pub fn message(source: Handle, payload: impl Into<Vec<u8>>) -> Self {
        Self::Message {
            source,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn error(source: Handle, detail: impl Into<String>) -> Self {
        Self::Error {
            source,
            detail: detail.into(),
        }
    }

    /// The handle of the producer that emitted this event, if any
    #[must_use]
    pub const fn source(&self) -> Option<Handle> {
        match self {
            Self::Message { source, .. }
            | Self::Close { source }
            | Self::Error { source, .. }
            | Self::Fire { source } => Some(*source),
            Self::Tick => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Close { .. })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::Fire { .. } => "fire",
            Self::Tick => "tick",
        }
    }
}

/// Reason a validator refused an input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
