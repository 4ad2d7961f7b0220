use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 50505;

/// Only protocol version spoken on the wire
pub const PROTOCOL_VERSION: i32 = 1;

/// Files strictly larger than this use the large chunk size (10 MiB)
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Chunk size for large files (5 MiB)
pub const LARGE_FILE_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Chunk size for everything else (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Upper bound on a single frame payload. Anything larger is a protocol violation.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Bound on TCP connect + TLS handshake for the sender
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the receiver's TLS handshake so idle sockets don't pin a handler
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Port, bind address and chunking policy of one transfer endpoint.
#[derive(Debug, Clone)]
pub struct TransferProtocolOptions {
    pub port: u16,
    pub bind_address: IpAddr,
}

impl Default for TransferProtocolOptions {
    fn default() -> Self {
        Self {
            port: TRANSFER_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl TransferProtocolOptions {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Chunk size used for a file of `length` bytes. Chosen once per file.
    pub fn chunk_size_for(length: u64) -> usize {
        if length > LARGE_FILE_THRESHOLD {
            LARGE_FILE_CHUNK_SIZE
        } else {
            DEFAULT_CHUNK_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_threshold() {
        assert_eq!(TransferProtocolOptions::chunk_size_for(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(
            TransferProtocolOptions::chunk_size_for(LARGE_FILE_THRESHOLD),
            DEFAULT_CHUNK_SIZE
        );
        assert_eq!(
            TransferProtocolOptions::chunk_size_for(LARGE_FILE_THRESHOLD + 1),
            LARGE_FILE_CHUNK_SIZE
        );
    }

    #[test]
    fn test_default_options() {
        let options = TransferProtocolOptions::default();
        assert_eq!(options.port, 50505);
        assert!(options.bind_address.is_unspecified());
        assert!(MAX_FRAME_PAYLOAD > LARGE_FILE_CHUNK_SIZE);
    }
}
