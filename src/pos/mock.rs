//! In-process simulated POS terminal.
//!
//! A [`PosTransport`] that plays the terminal side of the handshake: a valid
//! request frame is ACKed after a short delay and answered with an approved
//! response frame once the simulated card operation completes; an invalid
//! frame gets a NAK. Used by `--mock` startup mode and by the integration
//! tests, which steer it through [`MockController`] (decline codes, forced
//! NAK, silence, write failures).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::debug;

use super::codec::{build_frame, calculate_lrc, check_mac_value, parse_response, validate_frame};
use super::protocol::{PosRequest, TransactionType, ACK, DATA_LEN, FRAME_LEN, NAK};
use super::transport::PosTransport;

/// How the simulated terminal answers the initial request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge and, after the processing delay, send a response frame.
    Ack,
    /// Reject the request outright.
    Nak,
    /// Say nothing at all (drives the ACK-timeout path).
    Silent,
}

struct MockState {
    read_buf: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    ack_mode: Mutex<AckMode>,
    resp_code: Mutex<String>,
    /// When false the terminal ACKs but never sends the response frame.
    respond_after_ack: AtomicBool,
    fail_writes: AtomicBool,
    ack_delay: Mutex<Duration>,
    process_delay: Mutex<Duration>,
}

/// Handle for steering a [`MockTransport`] after ownership moved into the
/// engine. Cloneable; all clones share the same simulated terminal.
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

impl MockController {
    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.state.ack_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub fn set_resp_code(&self, code: &str) {
        *self.state.resp_code.lock().unwrap_or_else(|e| e.into_inner()) = code.to_string();
    }

    pub fn set_respond_after_ack(&self, respond: bool) {
        self.state.respond_after_ack.store(respond, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_process_delay(&self, delay: Duration) {
        *self
            .state
            .process_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.state.ack_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }
}

/// Simulated POS terminal speaking the wire protocol in-process.
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                read_buf: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                ack_mode: Mutex::new(AckMode::Ack),
                resp_code: Mutex::new("0000".to_string()),
                respond_after_ack: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                ack_delay: Mutex::new(Duration::from_millis(100)),
                process_delay: Mutex::new(Duration::from_secs(2)),
            }),
        }
    }

    pub fn controller(&self) -> MockController {
        MockController {
            state: self.state.clone(),
        }
    }

    /// Background half: play the terminal's side for one request frame.
    fn simulate_response(state: Arc<MockState>, valid: bool, request: Vec<u8>) {
        let ack_delay = *state.ack_delay.lock().unwrap_or_else(|e| e.into_inner());
        thread::sleep(ack_delay);
        if state.closed.load(Ordering::SeqCst) {
            return;
        }

        let mode = if valid {
            *state.ack_mode.lock().unwrap_or_else(|e| e.into_inner())
        } else {
            AckMode::Nak
        };

        match mode {
            AckMode::Silent => return,
            AckMode::Nak => {
                debug!("mock POS: sending NAK");
                state
                    .read_buf
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(NAK);
                return;
            }
            AckMode::Ack => {
                debug!("mock POS: sending ACK");
                state
                    .read_buf
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(ACK);
            }
        }

        if !state.respond_after_ack.load(Ordering::SeqCst) {
            return;
        }

        let process_delay = *state.process_delay.lock().unwrap_or_else(|e| e.into_inner());
        thread::sleep(process_delay);
        if state.closed.load(Ordering::SeqCst) {
            return;
        }

        let resp_code = state
            .resp_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let frame = build_response_frame(&request, &resp_code);
        debug!("mock POS: sending response frame");
        state
            .read_buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(frame);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PosTransport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err("mock port closed".to_string());
        }
        let mut queue = self
            .state
            .read_buf
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut n = 0;
        while n < buf.len() {
            match queue.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, String> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err("mock port closed".to_string());
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err("simulated write failure".to_string());
        }

        // Only full frames start a terminal interaction; the gateway's
        // single concluding ACK byte is swallowed here.
        if data.len() == FRAME_LEN {
            let valid = validate_frame(data);
            let state = self.state.clone();
            let request = data.to_vec();
            thread::spawn(move || MockTransport::simulate_response(state, valid, request));
        }
        Ok(data.len())
    }

    fn empty_input(&mut self) -> Result<(), String> {
        self.state
            .read_buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

/// Build the terminal's response to a request frame: echo the request
/// fields, stamp ApprovalNo "123456" and the response code, then redo the
/// check value and LRC over the modified DATA.
pub fn build_response_frame(request: &[u8], resp_code: &str) -> Vec<u8> {
    let req_fields = parse_response(request);

    let trans_type = req_fields
        .get("TransType")
        .and_then(|c| TransactionType::from_code(c))
        .unwrap_or(TransactionType::Echo);

    let base = PosRequest {
        trans_type,
        host_id: req_fields.get("HostID").cloned().unwrap_or_default(),
        amount: req_fields.get("Amount").cloned().unwrap_or_default(),
        order_no: Some(format!("MOCK_{}", Local::now().format("%H%M%S"))),
        pos_time: None,
    };
    let mut frame = build_frame(&base);

    // Response-only fields live inside the hash coverage, so both the check
    // value and the LRC must be recomputed after stamping them.
    frame[1 + 55..1 + 61].copy_from_slice(b"123456");
    frame[1 + 61..1 + 65].copy_from_slice(format!("{resp_code:0>4}").as_bytes());

    let hash = check_mac_value(&frame[1..1 + 492]);
    frame[1 + 506..1 + 546].copy_from_slice(format!("{hash:<40}").as_bytes());
    frame[FRAME_LEN - 1] = calculate_lrc(&frame[1..DATA_LEN + 2]);
    frame
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
