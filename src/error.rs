//! Error types for the target core
//!
//! Every variant here is fatal at connection granularity: nothing is
//! retried, and a failing connection always proceeds to its single
//! teardown path (detach from session, close socket).

use thiserror::Error;

/// Errors raised by the iSCSI target core
#[derive(Debug, Error)]
pub enum IscsiError {
    /// Socket-level error or peer close; triggers teardown.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrong opcode or PDU for the connection's current phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Lookup of a parameter that was never declared, negotiated, or
    /// defaulted. Must not be reachable once login has completed.
    #[error("settings error: {0}")]
    Settings(String),

    /// No mutually acceptable value for a required login parameter.
    #[error("negotiation failure: {0}")]
    Negotiation(String),

    /// Initiator insisted on a header or data digest the target does
    /// not implement.
    #[error("digest error: {0}")]
    Digest(String),

    /// CHAP exchange failed during the security stage.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Builder-time configuration problem.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type used throughout the crate
pub type ScsiResult<T> = Result<T, IscsiError>;
