//! End-to-end transaction scenarios: the engine against the in-process
//! simulated terminal and against a scripted TCP terminal.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ecpay_gateway::pos::codec::{build_frame, validate_frame};
use ecpay_gateway::pos::mock::{build_response_frame, AckMode, MockController, MockTransport};
use ecpay_gateway::pos::protocol::{ACK, FRAME_LEN};
use ecpay_gateway::pos::Scanner;
use ecpay_gateway::{PosRequest, TransactionEngine, TransactionError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_with_mock() -> (Arc<TransactionEngine>, MockController) {
    let engine = Arc::new(TransactionEngine::new(115200));
    let mock = MockTransport::new();
    let ctl = mock.controller();
    ctl.set_ack_delay(Duration::from_millis(50));
    ctl.set_process_delay(Duration::from_millis(150));
    engine.install_transport(Box::new(mock));
    (engine, ctl)
}

fn collect_states(engine: &TransactionEngine) -> Arc<Mutex<Vec<(String, bool)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.set_status_callback(Arc::new(move |info| {
        sink.lock()
            .unwrap()
            .push((info.state.to_string(), info.is_connected));
    }));
    seen
}

fn assert_phase_order(states: &[(String, bool)], expected: &[&str]) {
    let mut it = states.iter();
    for phase in expected {
        assert!(
            it.any(|(s, _)| s == phase),
            "phase {phase} missing or out of order in {states:?}"
        );
    }
}

/// Scripted terminal on a TCP socket: ACK the request, send a response with
/// the given code, then report the gateway's concluding bytes.
fn spawn_scripted_pos(resp_code: &'static str) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut request = vec![0u8; FRAME_LEN];
        conn.read_exact(&mut request).unwrap();
        assert!(validate_frame(&request), "gateway sent an invalid frame");

        thread::sleep(Duration::from_millis(100));
        conn.write_all(&[ACK]).unwrap();

        thread::sleep(Duration::from_millis(200));
        conn.write_all(&build_response_frame(&request, resp_code))
            .unwrap();

        // Whatever the gateway sends to conclude the handshake.
        let mut trailing = Vec::new();
        let _ = conn.set_read_timeout(Some(Duration::from_millis(500)));
        let mut buf = [0u8; 16];
        while let Ok(n) = conn.read(&mut buf) {
            if n == 0 {
                break;
            }
            trailing.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(trailing);
    });

    (addr, rx)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn happy_path_sale_over_tcp() {
    let (addr, trailing) = spawn_scripted_pos("0000");
    let engine = Arc::new(TransactionEngine::new(115200));
    assert!(engine.connect_to(&format!("tcp://{addr}")));
    let states = collect_states(&engine);

    let result = engine.execute(&PosRequest::sale("000000000100")).unwrap();
    assert_eq!(result["RespCode"], "0000");
    assert_eq!(result["ApprovalNo"], "123456");
    assert_eq!(result["Amount"], "000000000100");

    assert_phase_order(
        &states.lock().unwrap(),
        &["SENDING", "WAIT_ACK", "WAIT_RESPONSE", "PARSING", "SUCCESS", "IDLE"],
    );

    // The gateway concludes with exactly one ACK byte.
    let bytes = trailing.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(bytes, vec![ACK]);
}

#[test]
fn declined_sale_returns_fields_and_error() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_resp_code("0001");
    let states = collect_states(&engine);

    let err = engine.execute(&PosRequest::sale("100")).unwrap_err();
    assert_eq!(err.to_string(), "transaction declined: 0001");
    let fields = err.partial_result().expect("declined carries the result");
    assert_eq!(fields["RespCode"], "0001");
    assert_eq!(fields["ApprovalNo"], "123456");

    let states = states.lock().unwrap();
    assert_phase_order(&states, &["SENDING", "WAIT_ACK", "WAIT_RESPONSE", "PARSING", "ERROR", "IDLE"]);
    assert!(!states.iter().any(|(s, _)| s == "SUCCESS"));
    assert_eq!(engine.status().state, "IDLE");
}

#[test]
fn ack_timeout_after_five_seconds() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_ack_mode(AckMode::Silent);

    let error_seen = Arc::new(Mutex::new(None::<Instant>));
    {
        let error_seen = error_seen.clone();
        engine.set_status_callback(Arc::new(move |info| {
            if info.state == "ERROR" && error_seen.lock().unwrap().is_none() {
                *error_seen.lock().unwrap() = Some(Instant::now());
            }
        }));
    }

    let start = Instant::now();
    let err = engine.execute(&PosRequest::sale("100")).unwrap_err();
    assert!(matches!(err, TransactionError::AckTimeout));
    assert_eq!(err.to_string(), "timeout waiting for ACK");

    // The failure is observable at the 5 s phase budget; the engine then
    // lingers 2 s in Error before resetting.
    let error_at = error_seen.lock().unwrap().expect("no ERROR snapshot");
    let to_error = error_at.duration_since(start);
    assert!(
        to_error >= Duration::from_millis(4800) && to_error <= Duration::from_millis(5500),
        "ERROR after {to_error:?}"
    );

    // Connection survives an ACK timeout.
    assert!(engine.is_connected());
}

#[test]
fn nak_rejects_without_response_wait() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_ack_mode(AckMode::Nak);
    let states = collect_states(&engine);

    let err = engine.execute(&PosRequest::sale("100")).unwrap_err();
    assert!(matches!(err, TransactionError::Nak));
    assert_eq!(err.to_string(), "received NAK from POS");

    let states = states.lock().unwrap();
    assert!(!states.iter().any(|(s, _)| s == "WAIT_RESPONSE"));
    assert_phase_order(&states, &["SENDING", "WAIT_ACK", "ERROR", "IDLE"]);
    assert!(engine.is_connected());
}

#[test]
fn write_failure_drops_connection() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_fail_writes(true);
    let states = collect_states(&engine);

    let err = engine.execute(&PosRequest::sale("100")).unwrap_err();
    assert!(matches!(err, TransactionError::Write(_)));
    assert!(err.to_string().starts_with("write error:"));
    assert!(!engine.is_connected());

    // The Error snapshot precedes the disconnected one.
    let states = states.lock().unwrap();
    let error_idx = states.iter().position(|(s, _)| s == "ERROR").unwrap();
    let disconnect_idx = states.iter().position(|(_, c)| !c).unwrap();
    assert!(error_idx < disconnect_idx, "order was {states:?}");
}

#[test]
fn abort_during_wait_response() {
    let (engine, ctl) = engine_with_mock();
    // ACK arrives, the response never does; the operator aborts mid-wait.
    ctl.set_respond_after_ack(false);

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || engine.execute(&PosRequest::sale("100")))
    };

    // Let the transaction reach WaitResponse, then abort.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(engine.status().state, "WAIT_RESPONSE");
    let aborted_at = Instant::now();
    assert!(engine.abort_transaction());

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, TransactionError::Aborted));
    assert_eq!(err.to_string(), "transaction aborted");

    // Cancellation is observed within a poll interval; the remainder of the
    // return latency is the 2 s Error linger.
    let total = aborted_at.elapsed();
    assert!(total < Duration::from_millis(2600), "took {total:?}");
    assert_eq!(engine.status().state, "IDLE");

    // The terminal is still attached and usable afterwards.
    ctl.set_respond_after_ack(true);
    let result = engine.execute(&PosRequest::echo()).unwrap();
    assert_eq!(result["RespCode"], "0000");
}

#[test]
fn scanner_probe_attaches_second_candidate() {
    // First candidate: accepts the connection but never speaks.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let silent_addr = silent.local_addr().unwrap();
    thread::spawn(move || {
        let _conn = silent.accept();
        thread::sleep(Duration::from_secs(3));
    });

    // Second candidate: answers the ECHO probe, then accepts the engine's
    // persistent connection.
    let live = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_addr = live.local_addr().unwrap();
    thread::spawn(move || {
        let (mut conn, _) = live.accept().unwrap();
        let mut request = vec![0u8; FRAME_LEN];
        conn.read_exact(&mut request).unwrap();
        assert!(validate_frame(&request));
        conn.write_all(&[ACK]).unwrap();
        conn.write_all(&build_response_frame(&request, "0000")).unwrap();
        let mut one = [0u8; 1];
        let _ = conn.read_exact(&mut one);
        drop(conn);
        // The persistent attachment is a separate connection.
        let (_persistent, _) = live.accept().unwrap();
        thread::sleep(Duration::from_secs(1));
    });

    let engine = Arc::new(TransactionEngine::new(115200));
    let states = collect_states(&engine);
    let scanner = Scanner::new(engine.clone(), 115200);

    assert!(!scanner.probe(&format!("tcp://{silent_addr}")));
    assert!(!engine.is_connected());
    assert!(scanner.probe(&format!("tcp://{live_addr}")));
    assert!(engine.is_connected());

    let states = states.lock().unwrap();
    assert!(states.iter().any(|(_, connected)| *connected));
}

#[test]
fn request_frame_matches_wire_contract() {
    // Sanity-check the exact frame the engine puts on the wire.
    let frame = build_frame(&PosRequest::sale("000000000100"));
    assert_eq!(frame.len(), 603);
    assert_eq!(frame[0], 0x02);
    assert_eq!(frame[601], 0x03);
    assert!(validate_frame(&frame));
}

#[test]
fn mock_unsolicited_bytes_do_not_leak_into_next_transaction() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_ack_mode(AckMode::Nak);
    let _ = engine.execute(&PosRequest::sale("100")).unwrap_err();

    // Anything the terminal queued since is drained before the next send.
    ctl.set_ack_mode(AckMode::Ack);
    let result = engine.execute(&PosRequest::echo()).unwrap();
    assert_eq!(result["RespCode"], "0000");
    assert_eq!(result["TransType"], "80");
}

#[test]
fn cancel_signal_is_seen_during_wait_ack() {
    let (engine, ctl) = engine_with_mock();
    ctl.set_ack_mode(AckMode::Silent);

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || engine.execute(&PosRequest::sale("100")))
    };
    thread::sleep(Duration::from_millis(300));
    assert_eq!(engine.status().state, "WAIT_ACK");
    assert!(engine.abort_transaction());

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, TransactionError::Aborted));
}
