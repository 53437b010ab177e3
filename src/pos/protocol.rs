//! Wire constants and shared request types for the ECPay terminal protocol.
//!
//! The terminal speaks a framed, byte-oriented protocol: each message is a
//! 603-byte frame (`STX + 600-byte DATA + ETX + LRC`), acknowledged with
//! single in-band ACK/NAK bytes. This module holds the constants and the
//! request type; the byte-level encoding lives in [`super::codec`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Parsed response fields, keyed by wire field name with surrounding spaces
/// trimmed.
pub type TransactionResult = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Framing constants
// ---------------------------------------------------------------------------

/// Frame start marker.
pub const STX: u8 = 0x02;
/// Frame end marker.
pub const ETX: u8 = 0x03;
/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;

/// Width of the DATA region of a frame.
pub const DATA_LEN: usize = 600;
/// Total frame length: STX + DATA + ETX + LRC.
pub const FRAME_LEN: usize = DATA_LEN + 3;

/// Host identifier for the credit-card host.
pub const HOST_CREDIT_CARD: &str = "01";

// ---------------------------------------------------------------------------
// Transaction types
// ---------------------------------------------------------------------------

/// Transaction type, as carried in the `TransType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Sale,
    Refund,
    PreAuth,
    PreAuthCompletion,
    Settlement,
    Void,
    Echo,
}

impl TransactionType {
    /// Two-digit wire code for the `TransType` field.
    pub fn code(&self) -> &'static str {
        match self {
            TransactionType::Sale => "01",
            TransactionType::Refund => "02",
            TransactionType::PreAuth => "10",
            TransactionType::PreAuthCompletion => "11",
            TransactionType::Settlement => "50",
            TransactionType::Void => "60",
            TransactionType::Echo => "80",
        }
    }

    /// Reverse lookup from a wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "01" => Some(TransactionType::Sale),
            "02" => Some(TransactionType::Refund),
            "10" => Some(TransactionType::PreAuth),
            "11" => Some(TransactionType::PreAuthCompletion),
            "50" => Some(TransactionType::Settlement),
            "60" => Some(TransactionType::Void),
            "80" => Some(TransactionType::Echo),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single terminal request, before encoding.
///
/// Amounts are decimal strings without a decimal point ("100" = 1.00 in the
/// terminal's minor unit); the codec pads them to the 12-character field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosRequest {
    pub trans_type: TransactionType,
    /// Host identifier, 2 characters. "01" = credit card.
    pub host_id: String,
    /// Amount, up to 12 decimal characters. Empty means "0".
    pub amount: String,
    /// Original order number, for refunds/voids. Up to 20 characters.
    pub order_no: Option<String>,
    /// Request timestamp, `YYYYMMDDHHMMSS`. None means "now".
    pub pos_time: Option<String>,
}

impl PosRequest {
    pub fn new(trans_type: TransactionType) -> Self {
        Self {
            trans_type,
            host_id: HOST_CREDIT_CARD.to_string(),
            amount: String::new(),
            order_no: None,
            pos_time: None,
        }
    }

    pub fn sale(amount: &str) -> Self {
        Self {
            amount: amount.to_string(),
            ..Self::new(TransactionType::Sale)
        }
    }

    pub fn refund(amount: &str, order_no: &str) -> Self {
        Self {
            amount: amount.to_string(),
            order_no: Some(order_no.to_string()),
            ..Self::new(TransactionType::Refund)
        }
    }

    /// Settlement always carries a zero amount.
    pub fn settlement() -> Self {
        Self {
            amount: "0".to_string(),
            ..Self::new(TransactionType::Settlement)
        }
    }

    /// ECHO is the connection-test transaction; the scanner also uses it to
    /// identify live terminals.
    pub fn echo() -> Self {
        Self::new(TransactionType::Echo)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
