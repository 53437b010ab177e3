//! ECPay POS gateway.
//!
//! Mediates between a higher-level POS client (over a line-delimited JSON
//! control channel) and a credit-card terminal speaking a framed,
//! byte-oriented RS-232 protocol. The heart is the transaction engine in
//! [`pos`], which attaches to the terminal over serial or TCP, drives the
//! send → ACK → response → ACK handshake with per-phase timeouts and
//! user-cancellable waits, and broadcasts every state transition.

pub mod config;
pub mod control;
pub mod pos;

pub use config::Config;
pub use control::ControlServer;
pub use pos::{
    PosRequest, Scanner, TransactionEngine, TransactionError, TransactionResult, TransactionType,
};
