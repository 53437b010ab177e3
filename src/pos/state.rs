//! Transaction state machine.
//!
//! Holds the current phase, connection flag, per-phase start timestamp, last
//! error and the in-flight cancellation signal behind a single mutex. Every
//! mutation emits a [`StatusInfo`] snapshot to the registered callback; the
//! snapshot is computed under the lock and delivered after it is released,
//! so the callback may freely query the machine again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Phase of the POS transaction handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Idle,
    Sending,
    WaitAck,
    WaitResponse,
    Parsing,
    Success,
    Error,
    Timeout,
}

impl TransactionPhase {
    /// Wire name used in status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Idle => "IDLE",
            TransactionPhase::Sending => "SENDING",
            TransactionPhase::WaitAck => "WAIT_ACK",
            TransactionPhase::WaitResponse => "WAIT_RESPONSE",
            TransactionPhase::Parsing => "PARSING",
            TransactionPhase::Success => "SUCCESS",
            TransactionPhase::Error => "ERROR",
            TransactionPhase::Timeout => "TIMEOUT",
        }
    }

    /// Maximum duration budgeted for this phase, where one applies.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            TransactionPhase::Sending => Some(Duration::from_secs(2)),
            TransactionPhase::WaitAck => Some(Duration::from_secs(5)),
            TransactionPhase::WaitResponse => Some(Duration::from_secs(65)),
            TransactionPhase::Parsing => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Immutable status snapshot, broadcast to operators on every transition and
/// on the 1 Hz tick while a transaction is active.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub state: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trans_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub amount: String,
    pub is_connected: bool,
}

/// Observer invoked with a snapshot after every state change.
pub type StatusCallback = Arc<dyn Fn(StatusInfo) + Send + Sync>;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

struct StateInner {
    phase: TransactionPhase,
    started_instant: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    last_error: String,
    trans_type: String,
    amount: String,
    connected: bool,
    /// Guards single-flight execution: set by `start_transaction`, cleared
    /// by `reset`. The phase alone is not enough because it stays Idle
    /// between `start_transaction` and the first transition.
    in_flight: bool,
    cancel: Arc<AtomicBool>,
}

impl StateInner {
    fn snapshot(&self) -> StatusInfo {
        let (started_at, elapsed_ms, timeout_ms) = if self.phase == TransactionPhase::Idle {
            (None, 0, None)
        } else {
            (
                self.started_at,
                self.started_instant
                    .map(|t| t.elapsed().as_millis() as i64)
                    .unwrap_or(0),
                self.phase.timeout().map(|t| t.as_millis() as i64),
            )
        };

        let message = match self.phase {
            TransactionPhase::Idle => "Ready for transaction".to_string(),
            TransactionPhase::Sending => "Sending request to POS...".to_string(),
            TransactionPhase::WaitAck => "Waiting for POS acknowledgement...".to_string(),
            TransactionPhase::WaitResponse => "Waiting for card operation...".to_string(),
            TransactionPhase::Parsing => "Processing response...".to_string(),
            TransactionPhase::Success => "Transaction approved".to_string(),
            TransactionPhase::Error => format!("Transaction failed: {}", self.last_error),
            TransactionPhase::Timeout => "Transaction timed out".to_string(),
        };

        StatusInfo {
            state: self.phase.as_str(),
            message,
            started_at,
            elapsed_ms,
            timeout_ms,
            last_error: self.last_error.clone(),
            trans_type: self.trans_type.clone(),
            amount: self.amount.clone(),
            is_connected: self.connected,
        }
    }

    fn stamp(&mut self) {
        self.started_instant = Some(Instant::now());
        self.started_at = Some(Utc::now());
    }
}

/// Thread-safe transaction state machine.
pub struct StateMachine {
    inner: Mutex<StateInner>,
    callback: Mutex<Option<StatusCallback>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                phase: TransactionPhase::Idle,
                started_instant: None,
                started_at: None,
                last_error: String::new(),
                trans_type: String::new(),
                amount: String::new(),
                connected: false,
                in_flight: false,
                cancel: Arc::new(AtomicBool::new(false)),
            }),
            callback: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a snapshot to the callback, outside the state lock.
    fn emit(&self, info: StatusInfo) {
        let cb = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cb) = cb {
            cb(info);
        }
    }

    pub fn set_callback(&self, cb: StatusCallback) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(cb);
    }

    pub fn phase(&self) -> TransactionPhase {
        self.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn set_connected(&self, connected: bool) {
        let info = {
            let mut inner = self.lock();
            inner.connected = connected;
            inner.snapshot()
        };
        self.emit(info);
    }

    pub fn status(&self) -> StatusInfo {
        self.lock().snapshot()
    }

    /// Cancellation signal of the current transaction. Fresh per
    /// transaction; aborting stores `true` into it.
    pub fn cancel_signal(&self) -> Arc<AtomicBool> {
        self.lock().cancel.clone()
    }

    /// Begin a transaction. The phase stays Idle; the engine transitions to
    /// Sending right after. Fails when another transaction is in flight.
    pub fn start_transaction(&self, trans_type: &str, amount: &str) -> Result<(), String> {
        let mut inner = self.lock();
        if inner.phase != TransactionPhase::Idle || inner.in_flight {
            return Err("transaction already in progress".to_string());
        }
        inner.in_flight = true;
        inner.trans_type = trans_type.to_string();
        inner.amount = amount.to_string();
        inner.last_error.clear();
        inner.cancel = Arc::new(AtomicBool::new(false));
        Ok(())
    }

    pub fn transition_to(&self, phase: TransactionPhase) {
        let info = {
            let mut inner = self.lock();
            inner.phase = phase;
            inner.stamp();
            if phase != TransactionPhase::Error && phase != TransactionPhase::Timeout {
                inner.last_error.clear();
            }
            inner.snapshot()
        };
        self.emit(info);
    }

    pub fn transition_to_error(&self, err: &str) {
        let info = {
            let mut inner = self.lock();
            inner.phase = TransactionPhase::Error;
            inner.stamp();
            inner.last_error = err.to_string();
            inner.snapshot()
        };
        self.emit(info);
    }

    pub fn transition_to_timeout(&self) {
        let info = {
            let mut inner = self.lock();
            inner.phase = TransactionPhase::Timeout;
            inner.stamp();
            inner.last_error = "operation timed out".to_string();
            inner.snapshot()
        };
        self.emit(info);
    }

    /// Return to Idle after a transaction. Installs a fresh cancellation
    /// signal so an Idle machine never carries a signalled one.
    pub fn reset(&self) {
        let info = {
            let mut inner = self.lock();
            inner.phase = TransactionPhase::Idle;
            inner.trans_type.clear();
            inner.amount.clear();
            inner.started_instant = None;
            inner.started_at = None;
            inner.in_flight = false;
            inner.cancel = Arc::new(AtomicBool::new(false));
            inner.snapshot()
        };
        self.emit(info);
    }

    /// Cancel the in-flight transaction. Returns `true` when an abort was
    /// actually signalled, `false` when the machine was Idle.
    pub fn abort(&self) -> bool {
        let info = {
            let mut inner = self.lock();
            if inner.phase == TransactionPhase::Idle && !inner.in_flight {
                return false;
            }
            inner.cancel.store(true, Ordering::SeqCst);
            inner.phase = TransactionPhase::Error;
            inner.last_error = "aborted by user".to_string();
            inner.stamp();
            inner.snapshot()
        };
        self.emit(info);
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_machine() -> (Arc<StateMachine>, Arc<Mutex<Vec<StatusInfo>>>) {
        let machine = Arc::new(StateMachine::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine.set_callback(Arc::new(move |info| {
            sink.lock().unwrap().push(info);
        }));
        (machine, seen)
    }

    #[test]
    fn test_initial_state() {
        let machine = StateMachine::new();
        assert_eq!(machine.phase(), TransactionPhase::Idle);
        assert!(!machine.is_connected());
        let status = machine.status();
        assert_eq!(status.state, "IDLE");
        assert_eq!(status.message, "Ready for transaction");
        assert!(status.started_at.is_none());
    }

    #[test]
    fn test_phase_timeout_table() {
        assert_eq!(
            TransactionPhase::Sending.timeout(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            TransactionPhase::WaitAck.timeout(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            TransactionPhase::WaitResponse.timeout(),
            Some(Duration::from_secs(65))
        );
        assert_eq!(
            TransactionPhase::Parsing.timeout(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(TransactionPhase::Idle.timeout(), None);
        assert_eq!(TransactionPhase::Success.timeout(), None);
    }

    #[test]
    fn test_transition_emits_snapshot() {
        let (machine, seen) = collecting_machine();
        machine.transition_to(TransactionPhase::Sending);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, "SENDING");
        assert_eq!(seen[0].timeout_ms, Some(2000));
        assert!(seen[0].started_at.is_some());
    }

    #[test]
    fn test_start_transaction_rejects_second_entry() {
        let machine = StateMachine::new();
        machine.start_transaction("01", "100").unwrap();
        // Phase is still Idle, the in-flight guard must reject anyway.
        assert_eq!(machine.phase(), TransactionPhase::Idle);
        let err = machine.start_transaction("01", "200").unwrap_err();
        assert_eq!(err, "transaction already in progress");
    }

    #[test]
    fn test_start_transaction_records_fields() {
        let machine = StateMachine::new();
        machine.start_transaction("02", "250").unwrap();
        machine.transition_to(TransactionPhase::Sending);
        let status = machine.status();
        assert_eq!(status.trans_type, "02");
        assert_eq!(status.amount, "250");
    }

    #[test]
    fn test_fresh_cancel_signal_per_transaction() {
        let machine = StateMachine::new();
        machine.start_transaction("01", "100").unwrap();
        let first = machine.cancel_signal();
        first.store(true, Ordering::SeqCst);
        machine.reset();
        machine.start_transaction("01", "100").unwrap();
        let second = machine.cancel_signal();
        assert!(!second.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_transition_sets_message() {
        let (machine, seen) = collecting_machine();
        machine.transition_to_error("received NAK from POS");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].state, "ERROR");
        assert_eq!(seen[0].message, "Transaction failed: received NAK from POS");
        assert_eq!(seen[0].last_error, "received NAK from POS");
    }

    #[test]
    fn test_non_error_transition_clears_last_error() {
        let machine = StateMachine::new();
        machine.transition_to_error("boom");
        machine.transition_to(TransactionPhase::Sending);
        assert!(machine.status().last_error.is_empty());
    }

    #[test]
    fn test_timeout_transition() {
        let machine = StateMachine::new();
        machine.transition_to_timeout();
        let status = machine.status();
        assert_eq!(status.state, "TIMEOUT");
        assert_eq!(status.message, "Transaction timed out");
    }

    #[test]
    fn test_abort_idle_returns_false() {
        let machine = StateMachine::new();
        assert!(!machine.abort());
    }

    #[test]
    fn test_abort_signals_cancel() {
        let machine = StateMachine::new();
        machine.start_transaction("01", "100").unwrap();
        machine.transition_to(TransactionPhase::WaitResponse);
        let cancel = machine.cancel_signal();
        assert!(machine.abort());
        assert!(cancel.load(Ordering::SeqCst));
        let status = machine.status();
        assert_eq!(status.state, "ERROR");
        assert_eq!(status.last_error, "aborted by user");
    }

    #[test]
    fn test_abort_is_idempotent() {
        let machine = StateMachine::new();
        machine.start_transaction("01", "100").unwrap();
        machine.transition_to(TransactionPhase::WaitAck);
        assert!(machine.abort());
        assert!(machine.abort());
    }

    #[test]
    fn test_reset_clears_transaction() {
        let machine = StateMachine::new();
        machine.start_transaction("01", "100").unwrap();
        machine.transition_to(TransactionPhase::Success);
        machine.reset();
        let status = machine.status();
        assert_eq!(status.state, "IDLE");
        assert!(status.trans_type.is_empty());
        assert!(status.amount.is_empty());
        assert!(status.started_at.is_none());
        // A fresh transaction may start again.
        machine.start_transaction("01", "300").unwrap();
    }

    #[test]
    fn test_set_connected_emits() {
        let (machine, seen) = collecting_machine();
        machine.set_connected(true);
        machine.set_connected(false);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_connected);
        assert!(!seen[1].is_connected);
    }

    #[test]
    fn test_callback_may_reenter() {
        let machine = Arc::new(StateMachine::new());
        let inner = machine.clone();
        // Snapshot delivery happens outside the lock, so querying the
        // machine from the callback must not deadlock.
        machine.set_callback(Arc::new(move |_| {
            let _ = inner.status();
        }));
        machine.transition_to(TransactionPhase::Sending);
        machine.reset();
    }

    #[test]
    fn test_status_serializes_omitting_empty() {
        let machine = StateMachine::new();
        let json = serde_json::to_value(machine.status()).unwrap();
        assert_eq!(json["state"], "IDLE");
        assert!(json.get("last_error").is_none());
        assert!(json.get("started_at").is_none());
        assert!(json.get("trans_type").is_none());
    }
}
