//! Transaction failure taxonomy.

use thiserror::Error;

use super::protocol::TransactionResult;

/// Why a transaction did not complete.
///
/// Transport read timeouts never appear here; they are the polling
/// primitive, absorbed inside the wait loops. A declined transaction carries
/// the parsed response so the caller sees both the error and the fields.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("POS device not connected")]
    NotConnected,

    #[error("transaction already in progress")]
    InProgress,

    #[error("write error: {0}")]
    Write(String),

    #[error("received NAK from POS")]
    Nak,

    #[error("timeout waiting for ACK")]
    AckTimeout,

    #[error("transaction timeout")]
    ResponseTimeout,

    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid packet checksum")]
    InvalidChecksum,

    #[error("transaction declined: {code}")]
    Declined {
        code: String,
        fields: TransactionResult,
    },

    #[error("transaction aborted")]
    Aborted,
}

impl TransactionError {
    /// Best-effort partial result, present for declines.
    pub fn partial_result(&self) -> Option<&TransactionResult> {
        match self {
            TransactionError::Declined { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
