use crate::error::{Result, TransferError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::constants::PROTOCOL_VERSION;
use super::protocol::{
    ErrorMsg, FrameType, HandshakeMsg, ManifestMsg, read_frame, read_structured_frame,
    write_structured_frame,
};
use super::utils::{open_secure_file, resolve_destination};

/// Reply sent when the sender speaks another protocol version
pub const UNSUPPORTED_VERSION_MESSAGE: &str = "Unsupported protocol version.";

/// Destinations some session of one host is currently writing.
///
/// A second session for the same destination is refused instead of
/// truncating and interleaving with the first.
#[derive(Debug, Clone, Default)]
pub struct ActiveDestinations {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActiveDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `path` until the returned claim is dropped
    pub fn claim(&self, path: &Path) -> Option<DestinationClaim> {
        let inserted = self.lock().insert(path.to_path_buf());
        inserted.then(|| DestinationClaim {
            owner: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive hold on one destination path
#[derive(Debug)]
pub struct DestinationClaim {
    owner: ActiveDestinations,
    path: PathBuf,
}

impl Drop for DestinationClaim {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.path);
    }
}

/// How a receive session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// SessionComplete arrived after the file was written
    Completed { destination: PathBuf, bytes: u64 },
    /// The sender sent Cancel, or the host shut down. A partial file stays on disk.
    Cancelled { destination: Option<PathBuf> },
    Errored(TransferError),
}

/// Receive one file over an already authenticated stream.
///
/// Protocol, path and I/O failures are reported back to the sender with an
/// Error frame before the session ends.
pub async fn receive_session<S>(
    stream: &mut S,
    download_root: &Path,
    active: &ActiveDestinations,
    cancel: &CancellationToken,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut destination = None;

    let result = tokio::select! {
        res = run_session(stream, download_root, active, &mut destination) => res,
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
    };

    match result {
        Ok(outcome) => {
            let _ = stream.shutdown().await;
            outcome
        }
        Err(TransferError::Cancelled) => {
            tracing::info!("Receive session cancelled by host shutdown");
            SessionOutcome::Cancelled { destination }
        }
        Err(e) => {
            let message = match &e {
                TransferError::UnsupportedVersion(_) => UNSUPPORTED_VERSION_MESSAGE.to_string(),
                other => other.to_string(),
            };
            // The peer may already be gone; nothing more to do if this fails
            if write_structured_frame(stream, FrameType::Error, &ErrorMsg { message })
                .await
                .is_ok()
            {
                let _ = stream.flush().await;
            }
            let _ = stream.shutdown().await;
            SessionOutcome::Errored(e)
        }
    }
}

async fn run_session<S>(
    stream: &mut S,
    download_root: &Path,
    active: &ActiveDestinations,
    destination_slot: &mut Option<PathBuf>,
) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: HandshakeMsg = read_structured_frame(stream, FrameType::Handshake).await?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(TransferError::UnsupportedVersion(hello.protocol_version));
    }

    let manifest: ManifestMsg = read_structured_frame(stream, FrameType::Manifest).await?;
    let destination = resolve_destination(download_root, &manifest.relative_path).await?;
    // Held until the session ends, however it ends
    let _claim = active.claim(&destination).ok_or_else(|| {
        TransferError::protocol(format!(
            "{} is already being received by another session",
            manifest.relative_path
        ))
    })?;
    tracing::info!(
        "Receiving {} ({} bytes) into {:?}",
        manifest.relative_path,
        manifest.length,
        destination
    );

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = open_secure_file(&destination).await?;
    *destination_slot = Some(destination.clone());

    let mut received: u64 = 0;
    loop {
        let frame = read_frame(stream).await?;
        match frame.frame_type {
            FrameType::Chunk => {
                file.write_all(&frame.payload).await?;
                received += frame.payload.len() as u64;
                tracing::debug!("{}: {}/{} bytes", manifest.relative_path, received, manifest.length);
            }
            FrameType::FileComplete => {
                file.flush().await?;
            }
            FrameType::SessionComplete => {
                file.flush().await?;
                if received != manifest.length {
                    tracing::warn!(
                        "{} announced {} bytes but {} arrived",
                        manifest.relative_path,
                        manifest.length,
                        received
                    );
                }
                tracing::info!("Received {} ({} bytes)", manifest.relative_path, received);
                return Ok(SessionOutcome::Completed {
                    destination,
                    bytes: received,
                });
            }
            FrameType::Cancel => {
                file.flush().await?;
                tracing::info!(
                    "Sender cancelled {} after {} bytes",
                    manifest.relative_path,
                    received
                );
                return Ok(SessionOutcome::Cancelled {
                    destination: Some(destination),
                });
            }
            other => {
                return Err(TransferError::protocol(format!(
                    "Unexpected {:?} frame while receiving file data",
                    other
                )));
            }
        }
    }
}
