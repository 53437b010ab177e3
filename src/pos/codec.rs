//! Frame codec for the ECPay terminal protocol.
//!
//! Builds 603-byte request frames and parses/validates response frames.
//! Stateless: pure functions over byte buffers. The layout is length-strict:
//! every field has a fixed offset and width inside the 600-byte DATA region,
//! unspecified bytes are ASCII spaces.
//!
//! Integrity is two-layered: an XOR LRC over `DATA || ETX` guards the frame,
//! and a SHA-1 check value over `DATA[0..492]` (uppercase hex at offset 506)
//! guards the request fields.

use std::collections::HashMap;

use chrono::Local;
use sha1::{Digest, Sha1};

use super::protocol::{PosRequest, DATA_LEN, ETX, FRAME_LEN, STX};

/// Byte range of DATA covered by the SHA-1 check value.
const HASH_COVERAGE: usize = 492;

/// Offset/width of the check-value field inside DATA.
const HASH_OFFSET: usize = 506;
const HASH_WIDTH: usize = 40;

enum Pad {
    /// Numeric fields: left-pad with '0'.
    LeftZero,
    /// Text fields: right-pad with spaces.
    RightSpace,
}

/// Write a field into DATA, truncating over-long values to the field width.
fn write_field(data: &mut [u8], offset: usize, width: usize, value: &str, pad: Pad) {
    let value = if value.len() > width {
        &value[..width]
    } else {
        value
    };
    let formatted = match pad {
        Pad::LeftZero => format!("{value:0>width$}"),
        Pad::RightSpace => format!("{value:<width$}"),
    };
    data[offset..offset + width].copy_from_slice(formatted.as_bytes());
}

/// Read a field from DATA, trimming surrounding ASCII spaces.
fn read_field(data: &[u8], offset: usize, width: usize) -> String {
    if offset + width > data.len() {
        return String::new();
    }
    String::from_utf8_lossy(&data[offset..offset + width])
        .trim_matches(' ')
        .to_string()
}

/// XOR longitudinal redundancy check. The input must already include ETX;
/// STX never participates.
pub fn calculate_lrc(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |lrc, b| lrc ^ b)
}

/// SHA-1 check value over the raw field bytes, as 40 uppercase hex chars.
pub fn check_mac_value(payload: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    hex::encode_upper(hasher.finalize())
}

/// Build a complete 603-byte request frame for `req`.
///
/// Fills TransType, HostID, CUP flag, Amount (empty means "0"), OrderNo when
/// given, the request timestamp (local wall clock when unset) and the SHA-1
/// check value, then wraps DATA in `STX .. ETX LRC`.
pub fn build_frame(req: &PosRequest) -> Vec<u8> {
    let mut data = vec![0x20u8; DATA_LEN];

    write_field(&mut data, 0, 2, req.trans_type.code(), Pad::LeftZero);
    write_field(&mut data, 2, 2, &req.host_id, Pad::LeftZero);
    write_field(&mut data, 29, 2, "00", Pad::LeftZero);

    let amount = if req.amount.is_empty() {
        "0"
    } else {
        req.amount.as_str()
    };
    write_field(&mut data, 31, 12, amount, Pad::LeftZero);

    if let Some(order_no) = req.order_no.as_deref().filter(|o| !o.is_empty()) {
        write_field(&mut data, 88, 20, order_no, Pad::RightSpace);
    }

    let pos_time = req
        .pos_time
        .clone()
        .unwrap_or_else(|| Local::now().format("%Y%m%d%H%M%S").to_string());
    write_field(&mut data, 492, 14, &pos_time, Pad::LeftZero);

    // The check value covers fields before the timestamp/hash pair only.
    let hash = check_mac_value(&data[..HASH_COVERAGE]);
    write_field(&mut data, HASH_OFFSET, HASH_WIDTH, &hash, Pad::RightSpace);

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.push(STX);
    frame.extend_from_slice(&data);
    frame.push(ETX);
    frame.push(calculate_lrc(&frame[1..]));
    frame
}

/// Validate a received frame: exact length, STX/ETX markers, LRC match.
///
/// The response check value at offset 560 is deliberately not verified here;
/// the LRC is the inbound integrity gate.
pub fn validate_frame(frame: &[u8]) -> bool {
    if frame.len() != FRAME_LEN {
        return false;
    }
    if frame[0] != STX || frame[DATA_LEN + 1] != ETX {
        return false;
    }
    calculate_lrc(&frame[1..DATA_LEN + 2]) == frame[DATA_LEN + 2]
}

/// Parse the response fields out of a frame or a bare DATA region.
///
/// Accepts a full 603-byte frame, exactly 600 bytes of DATA, or any longer
/// buffer whose first 600 bytes are DATA (callers that already stripped the
/// framing). Anything shorter yields a single `Error` entry.
pub fn parse_response(packet: &[u8]) -> HashMap<String, String> {
    let data: &[u8] = if packet.len() == FRAME_LEN && packet[0] == STX {
        &packet[1..DATA_LEN + 1]
    } else if packet.len() == DATA_LEN {
        packet
    } else if packet.len() >= DATA_LEN {
        &packet[..DATA_LEN]
    } else {
        let mut err = HashMap::new();
        err.insert("Error".to_string(), "Invalid Packet Length".to_string());
        return err;
    };

    let mut fields = HashMap::new();
    let mut put = |key: &str, offset: usize, width: usize| {
        fields.insert(key.to_string(), read_field(data, offset, width));
    };

    put("TransType", 0, 2);
    put("HostID", 2, 2);
    put("Amount", 31, 12);
    put("TransDate", 43, 6);
    put("TransTime", 49, 6);
    put("ApprovalNo", 55, 6);
    put("RespCode", 61, 4);
    put("TerminalID", 65, 8);
    put("MerchantID", 73, 15);
    put("OrderNo", 88, 20);
    put("StoreID", 108, 18);
    put("CardType", 126, 2);
    put("CardNo", 10, 19);

    fields
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
