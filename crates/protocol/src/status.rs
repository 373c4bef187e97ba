//! Status codes reported to hosts

use serde::{Deserialize, Serialize};

/// Outcome category of a host call into the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    CompileError,
    RuntimeError,
    LimitExceeded,
    InvalidSession,
    SessionBusy,
    Cancelled,
    InitFailed,
    InvalidHandle,
    AlreadyReleased,
}

impl StatusCode {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Whether the session that produced this status can keep being used
    #[must_use]
    pub const fn session_usable(&self) -> bool {
        !matches!(self, Self::InvalidSession | Self::InitFailed)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::CompileError => "COMPILE_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::SessionBusy => "SESSION_BUSY",
            Self::Cancelled => "CANCELLED",
            Self::InitFailed => "INIT_FAILED",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::AlreadyReleased => "ALREADY_RELEASED",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status-code view of an execute call, for hosts that do not want the
/// typed error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecReport {
    pub status: StatusCode,
    /// Empty when `status` is `Ok`
    pub message: String,
}

impl ExecReport {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: StatusCode::Ok,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn failed(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_serialize_screaming() {
        let json = serde_json::to_string(&StatusCode::LimitExceeded).unwrap();
        assert_eq!(json, "\"LIMIT_EXCEEDED\"");
        assert_eq!(StatusCode::CompileError.to_string(), "COMPILE_ERROR");
    }

    #[test]
    fn only_session_level_failures_make_session_unusable() {
        assert!(StatusCode::RuntimeError.session_usable());
        assert!(StatusCode::LimitExceeded.session_usable());
        assert!(!StatusCode::InvalidSession.session_usable());
        assert!(!StatusCode::InitFailed.session_usable());
    }
}
