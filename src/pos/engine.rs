//! Transaction engine: drives one POS transaction end to end.
//!
//! Owns the transport slot and the state machine, and walks each transaction
//! through send → wait-ACK → wait-response → acknowledge with the per-phase
//! deadlines and cancellation checks. The engine is single-flight: a second
//! `execute` while one is running fails with "transaction already in
//! progress".
//!
//! During a transaction the transport is taken out of its slot and driven
//! without holding the lock; it is restored on the way out unless a write
//! failure dropped the connection. The scanner only operates while the
//! engine is detached, so live I/O is never shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::codec;
use super::error::TransactionError;
use super::protocol::{PosRequest, TransactionResult, ACK, FRAME_LEN, NAK, STX, ETX};
use super::scanner::{ScannerHandle, TransportOwner};
use super::state::{StateMachine, StatusCallback, StatusInfo, TransactionPhase};
use super::transport::{open_endpoint, PosTransport};

/// Whole-transaction deadline, covering every phase.
const OVERALL_TIMEOUT: Duration = Duration::from_secs(70);
/// How long the terminal may take to acknowledge a request.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the card operation may take before the response frame arrives.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(65);
/// Poll cadence while waiting for the ACK/NAK byte.
const ACK_POLL: Duration = Duration::from_millis(50);
/// Poll cadence while accumulating the response frame.
const RESPONSE_POLL: Duration = Duration::from_millis(100);
/// How long an Error state stays visible before the reset to Idle.
const ERROR_LINGER: Duration = Duration::from_secs(2);

/// Engine for executing transactions against the attached terminal.
pub struct TransactionEngine {
    state: Arc<StateMachine>,
    transport: Mutex<Option<Box<dyn PosTransport>>>,
    baud_rate: u32,
    rescan: Mutex<Option<ScannerHandle>>,
}

impl TransactionEngine {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            state: Arc::new(StateMachine::new()),
            transport: Mutex::new(None),
            baud_rate,
            rescan: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn PosTransport>>> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status_callback(&self, cb: StatusCallback) {
        self.state.set_callback(cb);
    }

    pub fn status(&self) -> StatusInfo {
        self.state.status()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Cancel the in-flight transaction, if any.
    pub fn abort_transaction(&self) -> bool {
        self.state.abort()
    }

    /// Hand the engine the scanner's rescan trigger. Keeps the engine and
    /// scanner decoupled: each side holds one narrow capability.
    pub fn set_rescan_handle(&self, handle: ScannerHandle) {
        *self.rescan.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn kick_rescan(&self) {
        if let Some(handle) = self.rescan.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            handle.force_rescan();
        }
    }

    /// Install an already-open transport and mark the engine attached.
    pub fn install_transport(&self, transport: Box<dyn PosTransport>) {
        let endpoint = transport.description();
        {
            let mut slot = self.slot();
            if let Some(mut old) = slot.take() {
                old.close();
            }
            *slot = Some(transport);
        }
        self.state.set_connected(true);
        info!(endpoint = %endpoint, "POS transport attached");
    }

    /// Open and attach a specific endpoint. Returns whether it succeeded.
    pub fn connect_to(&self, endpoint: &str) -> bool {
        info!(endpoint = endpoint, "Connecting to POS endpoint");
        match open_endpoint(endpoint, self.baud_rate) {
            Ok(transport) => {
                self.install_transport(transport);
                true
            }
            Err(e) => {
                warn!(endpoint = endpoint, error = %e, "Failed to connect");
                self.state.set_connected(false);
                false
            }
        }
    }

    /// Drop the transport and mark the engine detached.
    pub fn disconnect(&self) {
        if let Some(mut transport) = self.slot().take() {
            transport.close();
        }
        self.state.set_connected(false);
    }

    /// Drop the connection and ask the scanner to find the device again.
    pub fn reconnect(&self) -> Result<(), String> {
        info!("Reconnect requested");
        self.disconnect();
        let rescan = self.rescan.lock().unwrap_or_else(|e| e.into_inner());
        if rescan.is_some() {
            drop(rescan);
            self.kick_rescan();
            Ok(())
        } else {
            Err("no scanner available for reconnection".to_string())
        }
    }

    /// Execute one complete transaction:
    /// send → wait ACK → wait response → acknowledge → parse.
    pub fn execute(&self, req: &PosRequest) -> Result<TransactionResult, TransactionError> {
        info!(
            trans_type = req.trans_type.code(),
            amount = %req.amount,
            order_no = req.order_no.as_deref().unwrap_or(""),
            "Starting transaction"
        );

        // While connected and idle the slot always holds a transport; it is
        // only empty mid-transaction, which start_transaction rejects.
        if !self.state.is_connected() {
            return Err(TransactionError::NotConnected);
        }

        if let Err(e) = self
            .state
            .start_transaction(req.trans_type.code(), &req.amount)
        {
            error!(error = %e, "Cannot start transaction");
            return Err(TransactionError::InProgress);
        }

        let result = self.run_handshake(req);

        // Give the status sink time to show the failure before going Idle.
        if self.state.phase() == TransactionPhase::Error {
            thread::sleep(ERROR_LINGER);
        }
        self.state.reset();
        debug!("Transaction state reset to IDLE");

        result
    }

    fn run_handshake(&self, req: &PosRequest) -> Result<TransactionResult, TransactionError> {
        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let cancel = self.state.cancel_signal();

        self.state.transition_to(TransactionPhase::Sending);
        let frame = codec::build_frame(req);

        let mut transport = match self.slot().take() {
            Some(t) => t,
            None => {
                self.state.transition_to_error("POS device not connected");
                return Err(TransactionError::NotConnected);
            }
        };

        if let Err(e) = transport.empty_input() {
            warn!(error = %e, "Failed to reset input buffer");
        }

        if let Err(e) = transport.write(&frame) {
            self.handle_write_error(&e);
            return Err(TransactionError::Write(e));
        }
        debug!(bytes = frame.len(), "Request frame sent");

        let outcome = self.converse(transport.as_mut(), deadline, &cancel);

        // Restore the transport unless the connection was dropped meanwhile.
        if self.state.is_connected() {
            *self.slot() = Some(transport);
        } else {
            transport.close();
        }

        outcome
    }

    fn converse(
        &self,
        transport: &mut dyn PosTransport,
        deadline: Instant,
        cancel: &Arc<AtomicBool>,
    ) -> Result<TransactionResult, TransactionError> {
        self.state.transition_to(TransactionPhase::WaitAck);
        if let Err(e) = wait_for_ack(transport, deadline, cancel) {
            self.fail(&e);
            return Err(e);
        }
        debug!("ACK received");

        self.state.transition_to(TransactionPhase::WaitResponse);
        info!("Waiting for POS response (card operation)");
        let frame = match wait_for_response(transport, deadline, cancel) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.state.transition_to(TransactionPhase::Parsing);
        if !codec::validate_frame(&frame) {
            self.state.transition_to_error("invalid packet checksum");
            return Err(TransactionError::InvalidChecksum);
        }

        if let Err(e) = transport.write(&[ACK]) {
            warn!(error = %e, "Failed to send ACK");
        }

        let result = codec::parse_response(&frame);
        info!(
            resp_code = result.get("RespCode").map(String::as_str).unwrap_or(""),
            approval_no = result.get("ApprovalNo").map(String::as_str).unwrap_or(""),
            "Response parsed"
        );

        if let Some(code) = result.get("RespCode").filter(|c| c.as_str() != "0000") {
            let code = code.clone();
            self.state
                .transition_to_error(&format!("transaction declined: {code}"));
            return Err(TransactionError::Declined {
                code,
                fields: result,
            });
        }

        self.state.transition_to(TransactionPhase::Success);
        Ok(result)
    }

    /// Record a handshake failure in the state machine. An abort already
    /// moved the machine to Error with "aborted by user"; a response
    /// timeout gets the dedicated Timeout phase.
    fn fail(&self, err: &TransactionError) {
        match err {
            TransactionError::Aborted => {}
            TransactionError::ResponseTimeout => self.state.transition_to_timeout(),
            other => self.state.transition_to_error(&other.to_string()),
        }
    }

    fn handle_write_error(&self, err: &str) {
        error!(error = err, "Write error, connection may be lost");
        self.state
            .transition_to_error(&format!("write error: {err}"));
        self.state.set_connected(false);
        self.kick_rescan();
    }
}

impl TransportOwner for TransactionEngine {
    fn attach(&self, endpoint: &str) -> bool {
        self.connect_to(endpoint)
    }

    fn is_attached(&self) -> bool {
        self.is_connected()
    }
}

/// Poll for the single ACK/NAK byte. Stray bytes in the window are
/// discarded.
fn wait_for_ack(
    transport: &mut dyn PosTransport,
    deadline: Instant,
    cancel: &Arc<AtomicBool>,
) -> Result<(), TransactionError> {
    let phase_deadline = Instant::now() + ACK_TIMEOUT;
    let mut buf = [0u8; 64];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(TransactionError::Aborted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TransactionError::DeadlineExceeded);
        }
        if now >= phase_deadline {
            return Err(TransactionError::AckTimeout);
        }

        let n = match transport.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Read error during ACK wait");
                0
            }
        };
        for &byte in &buf[..n] {
            if byte == ACK {
                return Ok(());
            }
            if byte == NAK {
                return Err(TransactionError::Nak);
            }
        }
        if n == 0 {
            thread::sleep(ACK_POLL);
        }
    }
}

/// Accumulate bytes until a complete 603-byte frame is present: first STX,
/// last ETX, and the LRC byte after it.
fn wait_for_response(
    transport: &mut dyn PosTransport,
    deadline: Instant,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<u8>, TransactionError> {
    let phase_deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut buf = [0u8; 1024];
    let mut accumulated: Vec<u8> = Vec::new();

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(TransactionError::Aborted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TransactionError::DeadlineExceeded);
        }
        if now >= phase_deadline {
            return Err(TransactionError::ResponseTimeout);
        }

        let n = match transport.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Read error during response wait");
                0
            }
        };
        if n > 0 {
            accumulated.extend_from_slice(&buf[..n]);

            let stx = accumulated.iter().position(|&b| b == STX);
            let etx = accumulated.iter().rposition(|&b| b == ETX);
            if let (Some(stx), Some(etx)) = (stx, etx) {
                if etx > stx && accumulated.len() >= etx + 2 {
                    let candidate = &accumulated[stx..=etx + 1];
                    if candidate.len() == FRAME_LEN {
                        return Ok(candidate.to_vec());
                    }
                }
            }
        } else {
            thread::sleep(RESPONSE_POLL);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
