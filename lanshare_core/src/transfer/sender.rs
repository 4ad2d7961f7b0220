use crate::ResolvedTransferFile;
use crate::error::{Result, TransferError};
use crate::trust::{TofuServerVerifier, TrustStore};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::constants::{CONNECT_TIMEOUT, TransferProtocolOptions};
use super::protocol::{
    ErrorMsg, FrameType, HandshakeMsg, ManifestMsg, read_frame, write_frame,
    write_structured_frame,
};
use super::tls::{client_config, crypto_provider, server_name_for};

/// Grace period for best-effort frames sent while tearing a session down
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends one file per call. The orchestrator only talks to this seam.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// `progress` receives the size of every chunk once it has been written.
    async fn send_file(
        &self,
        target: &str,
        port: u16,
        file: &ResolvedTransferFile,
        progress: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// [`TransferClient`] over TLS, pinning receivers through a [`TrustStore`]
pub struct TlsTransferClient {
    trust: Arc<TrustStore>,
}

impl TlsTransferClient {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }
}

#[async_trait]
impl TransferClient for TlsTransferClient {
    async fn send_file(
        &self,
        target: &str,
        port: u16,
        file: &ResolvedTransferFile,
        progress: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = target.trim();
        tracing::debug!("Connecting to {}:{} for {}", target, port, file.relative_path);

        let tcp = or_cancel(cancel, async {
            timeout(CONNECT_TIMEOUT, TcpStream::connect((target, port)))
                .await
                .map_err(|_| TransferError::Timeout(format!("connecting to {}:{}", target, port)))
                .and_then(|connected| connected.map_err(TransferError::from))
        })
        .await?;
        tcp.set_nodelay(true)?;

        // Trust is keyed by the address being dialled
        let verifier = Arc::new(TofuServerVerifier::new(
            self.trust.clone(),
            target,
            crypto_provider(),
        ));
        let connector = TlsConnector::from(client_config(verifier.clone())?);
        let server_name = server_name_for(target)?;

        let handshake = or_cancel(cancel, async {
            timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .map_err(|_| TransferError::Timeout(format!("TLS handshake with {}", target)))
                .and_then(|handshake| handshake.map_err(TransferError::from))
        })
        .await;

        let mut tls = match handshake {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(reason) = verifier.take_rejection() {
                    tracing::error!("Refusing {}: {}", target, reason);
                    return Err(TransferError::Trust(reason));
                }
                return Err(e);
            }
        };

        match stream_file(&mut tls, file, progress, cancel).await {
            Ok(()) => {}
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => {
                // A receiver that rejected the file says why before closing
                if let Some(message) = read_remote_error(&mut tls, TEARDOWN_TIMEOUT).await {
                    return Err(TransferError::Remote(message));
                }
                return Err(e);
            }
        }

        // Every frame is out; a failed close_notify no longer affects the file
        if let Ok(Err(e)) = timeout(TEARDOWN_TIMEOUT, tls.shutdown()).await {
            tracing::debug!("TLS close with {} failed: {}", target, e);
        }

        if let Some(message) = read_remote_error(&mut tls, CONNECT_TIMEOUT).await {
            return Err(TransferError::Remote(message));
        }

        tracing::info!(
            "Sent {} ({} bytes) to {}",
            file.relative_path,
            file.length,
            target
        );
        Ok(())
    }
}

async fn stream_file<S>(
    stream: &mut S,
    file: &ResolvedTransferFile,
    progress: &(dyn Fn(u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    or_cancel(
        cancel,
        write_structured_frame(stream, FrameType::Handshake, &HandshakeMsg::default()),
    )
    .await?;

    let manifest = ManifestMsg {
        relative_path: file.relative_path.replace('\\', "/"),
        length: file.length,
    };
    or_cancel(
        cancel,
        write_structured_frame(stream, FrameType::Manifest, &manifest),
    )
    .await?;

    let chunk_size = TransferProtocolOptions::chunk_size_for(file.length);
    let mut source = or_cancel(cancel, async {
        File::open(&file.source_path)
            .await
            .map_err(TransferError::from)
    })
    .await?;
    let mut buffer = vec![0u8; chunk_size];

    loop {
        if cancel.is_cancelled() {
            return abort_session(stream).await;
        }

        let read = match or_cancel(cancel, async {
            source.read(&mut buffer).await.map_err(TransferError::from)
        })
        .await
        {
            Err(TransferError::Cancelled) => return abort_session(stream).await,
            other => other?,
        };
        if read == 0 {
            break;
        }

        or_cancel(cancel, write_frame(stream, FrameType::Chunk, &buffer[..read])).await?;
        progress(read as u64);
    }

    or_cancel(cancel, write_frame(stream, FrameType::FileComplete, &[])).await?;
    or_cancel(cancel, write_frame(stream, FrameType::SessionComplete, &[])).await?;
    or_cancel(cancel, async { stream.flush().await.map_err(TransferError::from) }).await?;
    Ok(())
}

/// Tell the receiver to stop. Only valid between frames.
async fn abort_session<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let _ = timeout(TEARDOWN_TIMEOUT, async {
        write_frame(stream, FrameType::Cancel, &[]).await?;
        stream.flush().await?;
        Ok::<_, TransferError>(())
    })
    .await;
    Err(TransferError::Cancelled)
}

/// Read whatever the receiver sent last. Only an Error frame matters.
async fn read_remote_error<S>(stream: &mut S, wait: Duration) -> Option<String>
where
    S: AsyncRead + Unpin + Send,
{
    match timeout(wait, read_frame(stream)).await {
        Ok(Ok(frame)) if frame.frame_type == FrameType::Error => {
            let message = serde_json::from_slice::<ErrorMsg>(&frame.payload)
                .map(|m| m.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned());
            Some(message)
        }
        _ => None,
    }
}

/// Race `fut` against `cancel`
async fn or_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        res = fut => res,
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
    }
}
