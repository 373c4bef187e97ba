//! Tether Execution Guard
//!
//! Per-session limits on untrusted script code (instruction count, wall-clock
//! deadline, memory ceiling, host cancellation, optional hostile-environment
//! probe) plus the pure validators capability adapters consult before they
//! touch the network or the file system.
//!
//! Default posture: bounded everything, relative workspace paths only.

mod guard;
mod validate;

pub use guard::*;
pub use validate::*;

use tether_protocol::Rejection;

/// Validator decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Rejection),
}

impl Verdict {
    pub fn reject(code: &str, message: impl Into<String>) -> Self {
        Self::Reject(Rejection::new(code, message))
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    /// Convert into a `Result` for callers that treat rejection as an error
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Accept => Ok(()),
            Self::Reject(reason) => Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_into_result() {
        assert!(Verdict::Accept.into_result().is_ok());
        match Verdict::reject("too_big", "nope").into_result() {
            Err(reason) => assert_eq!(reason.code, "too_big"),
            Ok(()) => panic!("Should reject"),
        }
    }
}
