//! Byte-stream transports to the POS terminal.
//!
//! Defines the `PosTransport` trait and concrete implementations for serial
//! (RS-232 / USB-serial) and TCP (serial-over-TCP devices, the simulated
//! terminal). Reads are bounded: a transport never blocks longer than
//! [`READ_TIMEOUT`] and reports an idle link as `Ok(0)` rather than an
//! error, which is what the engine's polling loops are built on.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

/// Upper bound for a single blocking read.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound for draining buffered input.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// TCP dial timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstract byte-level transport to a POS terminal.
///
/// Implementations absorb their own read timeouts: an idle link yields
/// `Ok(0)`, and only genuine I/O failures surface as errors.
pub trait PosTransport: Send {
    /// Read available bytes into `buf`. Returns `Ok(0)` when the link is
    /// idle for the read window.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String>;

    /// Transmit the whole buffer. Partial writes are a failure.
    fn write(&mut self, data: &[u8]) -> Result<usize, String>;

    /// Discard any bytes currently buffered on the input side.
    fn empty_input(&mut self) -> Result<(), String>;

    /// Tear down the connection.
    fn close(&mut self);

    /// Endpoint identifier, for logging and status display.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Physical serial port transport using the `serialport` crate.
///
/// The terminal link is fixed at 8 data bits, no parity, one stop bit and no
/// flow control; only the baud rate is configurable (115200 in deployments).
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, String> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| format!("Failed to open {port_name}: {e}"))?;

        info!(port = port_name, baud = baud_rate, "Serial port opened (8N1)");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            port: Some(port),
        })
    }
}

impl PosTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        let port = self.port.as_mut().ok_or("Serial port not open")?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(format!("Serial read error: {e}")),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, String> {
        let port = self.port.as_mut().ok_or("Serial port not open")?;
        port.write_all(data)
            .map_err(|e| format!("Serial write error: {e}"))?;
        port.flush()
            .map_err(|e| format!("Serial flush error: {e}"))?;
        Ok(data.len())
    }

    fn empty_input(&mut self) -> Result<(), String> {
        let port = self.port.as_mut().ok_or("Serial port not open")?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| format!("Failed to clear input buffer: {e}"))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.port_name, "Serial port closed");
        }
    }

    fn description(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// TCP transport for serial-over-TCP bridges and the simulated terminal.
pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn open(address: &str) -> Result<Self, String> {
        let addr: SocketAddr = address
            .to_socket_addrs()
            .map_err(|e| format!("Invalid address {address}: {e}"))?
            .next()
            .ok_or_else(|| format!("Address {address} did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| format!("TCP connect to {address} failed: {e}"))?;

        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| format!("Set read timeout: {e}"))?;
        let _ = stream.set_nodelay(true);

        info!(address = address, "Connected to POS over TCP");
        Ok(Self {
            address: address.to_string(),
            stream: Some(stream),
        })
    }

    fn drain(stream: &mut TcpStream) {
        let _ = stream.set_read_timeout(Some(DRAIN_TIMEOUT));
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => debug!(bytes = n, "Discarded buffered input"),
            }
        }
        let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    }
}

impl PosTransport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        let stream = self.stream.as_mut().ok_or("TCP not connected")?;
        match stream.read(buf) {
            // A clean zero-length read on TCP means the peer went away.
            Ok(0) => Err("connection closed by POS".to_string()),
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(format!("TCP read error: {e}")),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, String> {
        let stream = self.stream.as_mut().ok_or("TCP not connected")?;
        stream
            .write_all(data)
            .map_err(|e| format!("TCP write error: {e}"))?;
        stream
            .flush()
            .map_err(|e| format!("TCP flush error: {e}"))?;
        Ok(data.len())
    }

    fn empty_input(&mut self) -> Result<(), String> {
        let stream = self.stream.as_mut().ok_or("TCP not connected")?;
        Self::drain(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!(address = %self.address, "TCP connection closed");
        }
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Open a transport for an endpoint identifier.
///
/// `tcp://host:port` dials TCP; anything else is treated as a serial device
/// path (`COM3`, `/dev/ttyUSB0`, a PTY symlink under `/tmp`, ...).
pub fn open_endpoint(endpoint: &str, baud_rate: u32) -> Result<Box<dyn PosTransport>, String> {
    if let Some(address) = endpoint.strip_prefix("tcp://") {
        Ok(Box::new(TcpTransport::open(address)?))
    } else {
        Ok(Box::new(SerialTransport::open(endpoint, baud_rate)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
