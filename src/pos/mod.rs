//! POS terminal driver: protocol codec, transports, state machine,
//! transaction engine and device scanner.

pub mod codec;
pub mod engine;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod scanner;
pub mod state;
pub mod transport;

pub use engine::TransactionEngine;
pub use error::TransactionError;
pub use protocol::{PosRequest, TransactionResult, TransactionType};
pub use scanner::{Scanner, ScannerHandle, TransportOwner};
pub use state::{StateMachine, StatusInfo, TransactionPhase};
pub use transport::{open_endpoint, PosTransport};
