//! Startup configuration.

use std::path::PathBuf;

use clap::Parser;

/// Gateway between a POS client and an ECPay-style credit-card terminal.
#[derive(Debug, Clone, Parser)]
#[command(name = "ecpay-gateway", version, about)]
pub struct Config {
    /// POS endpoint: a serial device path (COM3, /dev/ttyUSB0) or
    /// tcp://host:port. When omitted the scanner auto-detects the terminal.
    #[arg(long, env = "ECPAY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Serial baud rate.
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,

    /// Control-channel listen address for client commands.
    #[arg(long, default_value = "127.0.0.1:8080", env = "ECPAY_BIND")]
    pub bind: String,

    /// Log directory for daily-rolling file logs. Console only when omitted.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Attach the in-process simulated terminal instead of real hardware.
    #[arg(long)]
    pub mock: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
