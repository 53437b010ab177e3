//! Auto-detection of POS terminals.
//!
//! While the engine is detached the scanner enumerates candidate endpoints,
//! probes each with an ECHO handshake and attaches the first one that
//! answers like a terminal. Schedule: an initial burst of three cycles one
//! second apart, then one cycle every twenty seconds while detached;
//! `force_rescan` runs a cycle off-schedule (the engine triggers it after a
//! write failure).
//!
//! The probe uses its own short-lived connection; on success it is closed
//! and the engine opens the endpoint again through the [`TransportOwner`]
//! capability, so the persistent handle is configured exactly once by its
//! owner.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::codec;
use super::protocol::{PosRequest, ACK, FRAME_LEN, NAK, STX};
use super::transport::{open_endpoint, PosTransport};

/// ACK window while probing; a real terminal acknowledges quickly.
const PROBE_ACK_TIMEOUT: Duration = Duration::from_millis(500);
/// Response window while probing; ECHO completes without card interaction.
const PROBE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Poll cadence inside the probe waits.
const PROBE_POLL: Duration = Duration::from_millis(20);

const BURST_ATTEMPTS: u32 = 3;
const BURST_PAUSE: Duration = Duration::from_secs(1);
const SCAN_INTERVAL: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// The narrow slice of the engine the scanner is allowed to touch.
pub trait TransportOwner: Send + Sync {
    /// Open `endpoint` persistently and mark the gateway attached.
    fn attach(&self, endpoint: &str) -> bool;

    /// Whether a transport is currently attached.
    fn is_attached(&self) -> bool;
}

/// Trigger handle for requesting an off-schedule scan cycle.
#[derive(Clone)]
pub struct ScannerHandle {
    trigger: Sender<()>,
}

impl ScannerHandle {
    pub fn force_rescan(&self) {
        let _ = self.trigger.send(());
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Background device scanner.
pub struct Scanner {
    owner: Arc<dyn TransportOwner>,
    baud_rate: u32,
    virtual_endpoints: Vec<String>,
}

impl Scanner {
    pub fn new(owner: Arc<dyn TransportOwner>, baud_rate: u32) -> Self {
        Self {
            owner,
            baud_rate,
            virtual_endpoints: default_virtual_endpoints(),
        }
    }

    /// Replace the well-known virtual endpoint list.
    pub fn with_virtual_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.virtual_endpoints = endpoints;
        self
    }

    /// Start the scanning loop on a background thread. The loop ends when
    /// every [`ScannerHandle`] has been dropped.
    pub fn spawn(self) -> ScannerHandle {
        let (trigger, requests) = mpsc::channel();
        thread::spawn(move || self.run(requests));
        ScannerHandle { trigger }
    }

    fn run(&self, requests: Receiver<()>) {
        info!("Starting POS device scanner");

        for _ in 0..BURST_ATTEMPTS {
            if self.scan_cycle() {
                break;
            }
            thread::sleep(BURST_PAUSE);
        }

        loop {
            match requests.recv_timeout(SCAN_INTERVAL) {
                Ok(()) => {
                    self.scan_cycle();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.owner.is_attached() {
                        self.scan_cycle();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Scanner stopped");
    }

    /// Probe every candidate once. Returns whether a terminal was attached.
    fn scan_cycle(&self) -> bool {
        info!("Scanning for POS device");

        let candidates = self.discover();
        if candidates.is_empty() {
            info!("No candidate endpoints found");
            return false;
        }
        debug!(count = candidates.len(), ?candidates, "Probing candidates");

        for endpoint in &candidates {
            if self.probe(endpoint) {
                info!(endpoint = %endpoint, "POS device found");
                return true;
            }
        }

        info!("No POS device found in this scan cycle");
        false
    }

    /// Candidate endpoints: hardware ports enumerated by the platform plus
    /// whichever well-known virtual endpoints exist, filtered and
    /// deduplicated.
    fn discover(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::new();

        match serialport::available_ports() {
            Ok(ports) => endpoints.extend(ports.into_iter().map(|p| p.port_name)),
            Err(e) => warn!(error = %e, "Failed to enumerate serial ports"),
        }

        for endpoint in &self.virtual_endpoints {
            if endpoint.starts_with("tcp://") || std::path::Path::new(endpoint).exists() {
                endpoints.push(endpoint.clone());
            }
        }

        filter_candidates(&endpoints, cfg!(target_os = "windows"))
    }

    /// ECHO-handshake a single endpoint and attach it on success.
    pub fn probe(&self, endpoint: &str) -> bool {
        debug!(endpoint = endpoint, "Probing endpoint");

        let mut transport = match open_endpoint(endpoint, self.baud_rate) {
            Ok(t) => t,
            Err(e) => {
                debug!(endpoint = endpoint, error = %e, "Failed to open");
                return false;
            }
        };

        if !probe_handshake(transport.as_mut(), endpoint) {
            return false;
        }

        // The probe connection is done; the engine opens its own handle.
        transport.close();
        self.owner.attach(endpoint)
    }
}

/// Drive the ECHO handshake on an open transport. Returns whether the far
/// side behaved like a POS terminal.
fn probe_handshake(transport: &mut dyn PosTransport, endpoint: &str) -> bool {
    if let Err(e) = transport.empty_input() {
        debug!(endpoint = endpoint, error = %e, "Failed to reset input buffer");
    }

    let frame = codec::build_frame(&PosRequest::echo());
    if let Err(e) = transport.write(&frame) {
        debug!(endpoint = endpoint, error = %e, "Failed to write ECHO");
        return false;
    }

    if !probe_wait_for_ack(transport, PROBE_ACK_TIMEOUT) {
        debug!(endpoint = endpoint, "No ACK");
        return false;
    }
    debug!(endpoint = endpoint, "ACK received");

    let response = match probe_wait_for_response(transport, PROBE_RESPONSE_TIMEOUT) {
        Some(r) => r,
        None => {
            debug!(endpoint = endpoint, "No response frame");
            return false;
        }
    };

    if !codec::validate_frame(&response) {
        debug!(endpoint = endpoint, "Invalid response frame");
        return false;
    }

    let fields = codec::parse_response(&response);
    if fields.get("TransType").map(String::as_str) != Some("80") {
        debug!(
            endpoint = endpoint,
            trans_type = fields.get("TransType").map(String::as_str).unwrap_or(""),
            "Unexpected transaction type"
        );
        return false;
    }

    // A non-zero response code still identifies a terminal, it may just be
    // busy.
    if fields.get("RespCode").map(String::as_str) != Some("0000") {
        debug!(
            endpoint = endpoint,
            resp_code = fields.get("RespCode").map(String::as_str).unwrap_or(""),
            "ECHO completed with non-zero response code"
        );
    }

    let _ = transport.write(&[ACK]);
    info!(endpoint = endpoint, "ECHO handshake successful");
    true
}

fn probe_wait_for_ack(transport: &mut dyn PosTransport, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];

    while Instant::now() < deadline {
        let n = transport.read(&mut buf).unwrap_or(0);
        for &byte in &buf[..n] {
            if byte == ACK {
                return true;
            }
            if byte == NAK {
                debug!("Received NAK, device present but rejected the probe");
                return false;
            }
        }
        if n == 0 {
            thread::sleep(PROBE_POLL);
        }
    }
    false
}

fn probe_wait_for_response(transport: &mut dyn PosTransport, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1024];
    let mut accumulated: Vec<u8> = Vec::new();

    while Instant::now() < deadline {
        let n = transport.read(&mut buf).unwrap_or(0);
        if n > 0 {
            accumulated.extend_from_slice(&buf[..n]);
            if accumulated.len() >= FRAME_LEN {
                for i in 0..=accumulated.len() - FRAME_LEN {
                    if accumulated[i] == STX {
                        return Some(accumulated[i..i + FRAME_LEN].to_vec());
                    }
                }
            }
        } else {
            thread::sleep(PROBE_POLL);
        }
    }
    None
}

/// Well-known virtual endpoints: PTY symlinks used by the external terminal
/// simulator, and in development builds its TCP listener.
fn default_virtual_endpoints() -> Vec<String> {
    let mut endpoints = vec![
        "/tmp/mock-pos-pty".to_string(),
        "/tmp/virtual-serial".to_string(),
    ];
    if cfg!(debug_assertions) {
        endpoints.push("tcp://localhost:9999".to_string());
    }
    endpoints
}

/// Platform filter over candidate endpoint names, with deduplication.
fn filter_candidates(endpoints: &[String], windows: bool) -> Vec<String> {
    let mut filtered = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for endpoint in endpoints {
        if !seen.insert(endpoint.clone()) {
            continue;
        }

        if endpoint.starts_with("tcp://") {
            filtered.push(endpoint.clone());
            continue;
        }

        if windows {
            if endpoint.to_uppercase().starts_with("COM") {
                filtered.push(endpoint.clone());
            }
            continue;
        }

        let lower = endpoint.to_lowercase();
        if lower.contains("bluetooth") {
            continue;
        }
        if lower.contains("ttyusb")
            || lower.contains("ttyacm")
            || lower.contains("usbserial")
            || lower.contains("cu.")
            || lower.contains("ttys")
            || endpoint.starts_with("/tmp/")
        {
            filtered.push(endpoint.clone());
        }
    }

    filtered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
