//! Host Error Taxonomy
//!
//! Every failure the core can surface carries a stable machine-readable code
//! alongside a human-readable message. Callers branch on [`HostError::code`];
//! the message is for logs and terminal turn events.
//!
//! # Design Philosophy
//!
//! Connection failures never escape as panics or silent drops: they are caught
//! at the translator boundary and converted into terminal turn errors for
//! in-flight turns, plus rejection of still-pending turns. Malformed fragments
//! inside a single native event degrade to an empty default instead of
//! aborting the turn.

use thiserror::Error;

/// Stable error codes, as carried by terminal turn events
pub mod codes {
    /// See [`super::HostError::SessionNotFound`]
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    /// See [`super::HostError::SessionCreateFailed`]
    pub const SESSION_CREATE_FAILED: &str = "SESSION_CREATE_FAILED";
    /// See [`super::HostError::ProcessCrash`]
    pub const PROCESS_CRASH: &str = "PROCESS_CRASH";
    /// See [`super::HostError::ProtocolError`]
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    /// See [`super::HostError::InterruptFailed`]
    pub const INTERRUPT_FAILED: &str = "INTERRUPT_FAILED";
    /// See [`super::HostError::InvalidStreamEvent`]
    pub const INVALID_STREAM_EVENT: &str = "INVALID_STREAM_EVENT";
    /// See [`super::HostError::UnsupportedCliType`]
    pub const UNSUPPORTED_CLI_TYPE: &str = "UNSUPPORTED_CLI_TYPE";
}

/// Errors surfaced by the session host and its collaborators
#[derive(Debug, Error)]
pub enum HostError {
    /// The session id is unknown (never created, killed, or evicted)
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The id that failed to resolve
        session_id: String,
    },

    /// Opening the agent connection for a new or resumed session failed
    #[error("session create failed: {message}")]
    SessionCreateFailed {
        /// What went wrong
        message: String,
        /// Underlying cause from the connection layer, if any
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The agent process died or the connection was torn down underneath us
    #[error("agent process crashed: {message}")]
    ProcessCrash {
        /// Crash description (e.g. "evicted", "agent process exited")
        message: String,
    },

    /// The native event stream violated its protocol contract
    #[error("protocol error: {message}")]
    ProtocolError {
        /// What the stream did wrong
        message: String,
    },

    /// The best-effort interrupt request could not be delivered
    #[error("interrupt failed: {message}")]
    InterruptFailed {
        /// Why the interrupt was not delivered
        message: String,
    },

    /// A native event could not be interpreted at all
    #[error("invalid stream event: {message}")]
    InvalidStreamEvent {
        /// Description of the malformed event
        message: String,
    },

    /// The requested provider protocol is not supported by this host
    #[error("unsupported cli type: {cli_type}")]
    UnsupportedCliType {
        /// The offending provider identifier
        cli_type: String,
    },
}

impl HostError {
    /// Stable machine-readable code for this error
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::SessionCreateFailed { .. } => "SESSION_CREATE_FAILED",
            Self::ProcessCrash { .. } => "PROCESS_CRASH",
            Self::ProtocolError { .. } => "PROTOCOL_ERROR",
            Self::InterruptFailed { .. } => "INTERRUPT_FAILED",
            Self::InvalidStreamEvent { .. } => "INVALID_STREAM_EVENT",
            Self::UnsupportedCliType { .. } => "UNSUPPORTED_CLI_TYPE",
        }
    }

    /// Shorthand for a [`HostError::ProcessCrash`]
    pub fn crash(message: impl Into<String>) -> Self {
        Self::ProcessCrash {
            message: message.into(),
        }
    }

    /// Shorthand for a [`HostError::SessionNotFound`]
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Rebuild an error value from a stable code and detail message.
    ///
    /// Variants whose field is not a free-form message carry the detail
    /// in that field; unknown codes map to a process crash.
    #[must_use]
    pub fn for_code(code: &str, message: &str) -> Self {
        match code {
            codes::SESSION_NOT_FOUND => Self::SessionNotFound {
                session_id: message.to_string(),
            },
            codes::SESSION_CREATE_FAILED => Self::SessionCreateFailed {
                message: message.to_string(),
                source: None,
            },
            codes::PROTOCOL_ERROR => Self::ProtocolError {
                message: message.to_string(),
            },
            codes::INTERRUPT_FAILED => Self::InterruptFailed {
                message: message.to_string(),
            },
            codes::INVALID_STREAM_EVENT => Self::InvalidStreamEvent {
                message: message.to_string(),
            },
            codes::UNSUPPORTED_CLI_TYPE => Self::UnsupportedCliType {
                cli_type: message.to_string(),
            },
            _ => Self::ProcessCrash {
                message: message.to_string(),
            },
        }
    }
}

impl Clone for HostError {
    fn clone(&self) -> Self {
        // anyhow::Error is not Clone; the cause is only carried on the
        // original instance, clones keep the code and message.
        match self {
            Self::SessionNotFound { session_id } => Self::SessionNotFound {
                session_id: session_id.clone(),
            },
            Self::SessionCreateFailed { message, .. } => Self::SessionCreateFailed {
                message: message.clone(),
                source: None,
            },
            Self::ProcessCrash { message } => Self::ProcessCrash {
                message: message.clone(),
            },
            Self::ProtocolError { message } => Self::ProtocolError {
                message: message.clone(),
            },
            Self::InterruptFailed { message } => Self::InterruptFailed {
                message: message.clone(),
            },
            Self::InvalidStreamEvent { message } => Self::InvalidStreamEvent {
                message: message.clone(),
            },
            Self::UnsupportedCliType { cli_type } => Self::UnsupportedCliType {
                cli_type: cli_type.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(HostError::not_found("s1").code(), "SESSION_NOT_FOUND");
        assert_eq!(HostError::crash("boom").code(), "PROCESS_CRASH");
        assert_eq!(
            HostError::SessionCreateFailed {
                message: "spawn failed".to_string(),
                source: None,
            }
            .code(),
            "SESSION_CREATE_FAILED"
        );
        assert_eq!(
            HostError::UnsupportedCliType {
                cli_type: "telnet".to_string(),
            }
            .code(),
            "UNSUPPORTED_CLI_TYPE"
        );
    }

    #[test]
    fn test_for_code_round_trips() {
        assert_eq!(
            HostError::for_code("SESSION_NOT_FOUND", "s1").code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(
            HostError::for_code("PROTOCOL_ERROR", "bad frame").code(),
            "PROTOCOL_ERROR"
        );
        // Unknown codes degrade to a crash.
        assert_eq!(HostError::for_code("MYSTERY", "boom").code(), "PROCESS_CRASH");
    }

    #[test]
    fn test_clone_drops_cause_keeps_message() {
        let err = HostError::SessionCreateFailed {
            message: "spawn failed".to_string(),
            source: Some(anyhow::anyhow!("ENOENT")),
        };
        let cloned = err.clone();
        assert_eq!(cloned.code(), "SESSION_CREATE_FAILED");
        assert_eq!(cloned.to_string(), "session create failed: spawn failed");
    }

    #[test]
    fn test_display_includes_message() {
        let err = HostError::crash("evicted");
        assert_eq!(err.to_string(), "agent process crashed: evicted");
    }
}
