//! TLS file transfer.
//!
//! This module provides:
//! - Frame encoding shared by both ends
//! - TLS configs anchored in the receiver identity and the trust store
//! - The receiver host (one file per accepted connection)
//! - The sender and the orchestrator that drives it over a queue

pub mod constants;
pub mod orchestrator;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod tls;
pub mod utils;

// Re-export public API
pub use constants::{TRANSFER_PORT, TransferProtocolOptions};
pub use orchestrator::{ProgressAggregator, TransferOrchestrator, resolve_files};
pub use receiver::{ActiveDestinations, SessionOutcome};
pub use sender::{TlsTransferClient, TransferClient};
pub use server::ReceiverHost;
