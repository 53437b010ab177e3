//! Control channel between the gateway and its client.
//!
//! The surrounding client (a web till, an Electron shell) talks to the
//! gateway over a request/response channel; this module is the gateway-side
//! terminus: a TCP listener speaking newline-delimited JSON. Each line in is
//! a command (`SALE`, `REFUND`, `SETTLEMENT`, `ECHO`, `STATUS`, `ABORT`,
//! `RECONNECT`); each line out is a response or a broadcast status update.
//! Status snapshots go to every connected client on each state transition
//! and on a 1 Hz tick while a transaction is active.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pos::{PosRequest, StatusInfo, TransactionEngine};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A command line from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub order_no: String,
}

/// A response or broadcast line to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    /// "success", "error", "processing" or "status_update".
    pub status: String,
    pub message: String,
    /// "transaction", "control" or "status".
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ControlResponse {
    fn control(status: &str, message: &str) -> Self {
        Self {
            status: status.to_string(),
            message: message.to_string(),
            command_type: "control".to_string(),
            data: None,
        }
    }

    fn transaction(status: &str, message: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            status: status.to_string(),
            message: message.to_string(),
            command_type: "transaction".to_string(),
            data,
        }
    }

    fn status_update(info: &StatusInfo) -> Self {
        Self {
            status: "status_update".to_string(),
            message: info.message.clone(),
            command_type: "status".to_string(),
            data: serde_json::to_value(info).ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Control-channel server and status broadcaster.
pub struct ControlServer {
    engine: Arc<TransactionEngine>,
    clients: Mutex<HashMap<u64, TcpStream>>,
    next_client_id: AtomicU64,
    /// One transaction command at a time per gateway; overlapping commands
    /// are answered with "POS is busy" instead of queueing.
    busy: Mutex<()>,
}

impl ControlServer {
    pub fn new(engine: Arc<TransactionEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            busy: Mutex::new(()),
        })
    }

    /// Wire the engine's status callback to the broadcast fan-out and start
    /// the 1 Hz ticker for active transactions.
    pub fn start_status_broadcast(self: Arc<Self>) {
        let server = self.clone();
        self.engine
            .set_status_callback(Arc::new(move |info| server.broadcast_status(&info)));

        let server = self.clone();
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(1));
            let status = server.engine.status();
            if status.state != "IDLE" {
                server.broadcast_status(&status);
            }
        });
    }

    /// Accept clients forever on `bind`.
    pub fn serve(self: Arc<Self>, bind: &str) -> Result<(), String> {
        let listener =
            TcpListener::bind(bind).map_err(|e| format!("Failed to bind {bind}: {e}"))?;
        info!(bind = bind, "Control channel listening");
        self.serve_on(listener)
    }

    /// Accept clients forever on an already-bound listener.
    pub fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<(), String> {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || server.handle_client(stream));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
        Ok(())
    }

    fn handle_client(self: Arc<Self>, stream: TcpStream) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(client = client_id, peer = %peer, "Control client connected");

        let write_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to clone client stream");
                return;
            }
        };
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id, write_half);

        // New clients get the current status immediately.
        self.send_to(client_id, &ControlResponse::status_update(&self.engine.status()));

        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            self.clone().handle_line(client_id, &line);
        }

        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&client_id);
        info!(client = client_id, "Control client disconnected");
    }

    fn handle_line(self: Arc<Self>, client_id: u64, line: &str) {
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => {
                self.send_to(client_id, &ControlResponse::control("error", "Invalid JSON"));
                return;
            }
        };

        match request.command.as_str() {
            "STATUS" => {
                self.send_to(
                    client_id,
                    &ControlResponse::status_update(&self.engine.status()),
                );
            }
            "ABORT" => {
                let response = if self.engine.abort_transaction() {
                    ControlResponse::control("success", "Transaction aborted")
                } else {
                    ControlResponse::control("error", "No transaction to abort")
                };
                self.send_to(client_id, &response);
            }
            "RECONNECT" => {
                let server = self.clone();
                thread::spawn(move || {
                    server.send_to(
                        client_id,
                        &ControlResponse::control("processing", "Reconnecting to POS..."),
                    );
                    let response = match server.engine.reconnect() {
                        Ok(()) => ControlResponse::control("success", "Reconnected to POS"),
                        Err(e) => ControlResponse::control("error", &e),
                    };
                    server.send_to(client_id, &response);
                });
            }
            "SALE" | "REFUND" | "SETTLEMENT" | "ECHO" => {
                let server = self.clone();
                thread::spawn(move || server.handle_transaction(client_id, request));
            }
            _ => {
                self.send_to(
                    client_id,
                    &ControlResponse::control("error", "Unknown Command"),
                );
            }
        }
    }

    fn handle_transaction(self: Arc<Self>, client_id: u64, request: ControlRequest) {
        let _guard = match self.busy.try_lock() {
            Ok(g) => g,
            Err(_) => {
                self.send_to(
                    client_id,
                    &ControlResponse::transaction("error", "POS is busy", None),
                );
                return;
            }
        };

        let pos_request = match request.command.as_str() {
            "SALE" => PosRequest::sale(&request.amount),
            "REFUND" => PosRequest::refund(&request.amount, &request.order_no),
            "SETTLEMENT" => PosRequest::settlement(),
            _ => PosRequest::echo(),
        };

        let response = match self.engine.execute(&pos_request) {
            Ok(result) => ControlResponse::transaction(
                "success",
                "Transaction Approved",
                serde_json::to_value(result).ok(),
            ),
            Err(e) => {
                let data = e
                    .partial_result()
                    .and_then(|fields| serde_json::to_value(fields).ok());
                ControlResponse::transaction("error", &e.to_string(), data)
            }
        };
        self.send_to(client_id, &response);
    }

    fn send_to(&self, client_id: u64, response: &ControlResponse) {
        let payload = match serde_json::to_string(response) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to serialize response");
                return;
            }
        };
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = clients.get_mut(&client_id) {
            if writeln!(stream, "{payload}").is_err() {
                clients.remove(&client_id);
            }
        }
    }

    fn broadcast_status(&self, info: &StatusInfo) {
        let response = ControlResponse::status_update(info);
        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(_) => return,
        };
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        for (&id, stream) in clients.iter_mut() {
            if writeln!(stream, "{payload}").is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            clients.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
