use crate::config::SettingsService;
use crate::error::{Result, TransferError};
use crate::identity::ServerIdentity;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::constants::{HANDSHAKE_TIMEOUT, TransferProtocolOptions};
use super::receiver::{ActiveDestinations, SessionOutcome, receive_session};
use super::tls::server_config;

/// Listens for senders and receives one file per accepted connection.
pub struct ReceiverHost {
    options: TransferProtocolOptions,
    settings: Arc<dyn SettingsService>,
    /// Destinations being written by this host's sessions
    active: ActiveDestinations,
    state: Mutex<HostState>,
}

struct HostState {
    identity: Option<ServerIdentity>,
    acceptor: Option<TlsAcceptor>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    /// Stops the accept loop
    shutdown: CancellationToken,
    /// Aborts in-flight sessions
    sessions: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl ReceiverHost {
    pub fn new(
        options: TransferProtocolOptions,
        settings: Arc<dyn SettingsService>,
        identity: ServerIdentity,
    ) -> Result<Self> {
        let acceptor = TlsAcceptor::from(server_config(&identity)?);
        Ok(Self {
            options,
            settings,
            active: ActiveDestinations::new(),
            state: Mutex::new(HostState {
                identity: Some(identity),
                acceptor: Some(acceptor),
                running: None,
            }),
        })
    }

    /// Bind and start accepting. Calling it again while running returns the
    /// address already bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        if let Some(running) = &state.running {
            return Ok(running.local_addr);
        }

        let acceptor = state
            .acceptor
            .clone()
            .ok_or_else(|| TransferError::Settings("Receiver host was disposed".into()))?;

        let bind_addr = SocketAddr::new(self.options.bind_address, self.options.port);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Receiver listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let sessions = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.settings.clone(),
            self.active.clone(),
            tracker.clone(),
            shutdown.clone(),
            sessions.clone(),
        ));

        state.running = Some(Running {
            local_addr,
            shutdown,
            sessions,
            tracker,
            accept_task,
        });

        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.local_addr)
    }

    /// Fingerprint senders will pin, until the host is disposed
    pub async fn fingerprint(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .identity
            .as_ref()
            .map(|identity| identity.fingerprint().to_string())
    }

    /// Stop accepting and wait for in-flight sessions.
    ///
    /// If `cancel` fires first the sessions are aborted, awaited and
    /// [`TransferError::Cancelled`] is returned.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let running = self.state.lock().await.running.take();
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }
        running.tracker.close();

        tokio::select! {
            _ = running.tracker.wait() => {
                tracing::info!("Receiver on {} stopped", running.local_addr);
                Ok(())
            }
            _ = cancel.cancelled() => {
                running.sessions.cancel();
                running.tracker.wait().await;
                tracing::info!("Receiver on {} stopped, sessions aborted", running.local_addr);
                Err(TransferError::Cancelled)
            }
        }
    }

    /// Stop, then release the identity. The host cannot be started again.
    pub async fn dispose(&self) -> Result<()> {
        self.stop(&CancellationToken::new()).await?;
        let mut state = self.state.lock().await;
        state.acceptor = None;
        state.identity = None;
        Ok(())
    }
}

impl Drop for ReceiverHost {
    fn drop(&mut self) {
        if let Some(running) = self.state.get_mut().running.take() {
            running.shutdown.cancel();
            running.sessions.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    settings: Arc<dyn SettingsService>,
    active: ActiveDestinations,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    sessions: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        tracing::debug!("Accepted connection from {}", peer);
        tracker.spawn(handle_connection(
            tcp,
            peer,
            acceptor.clone(),
            settings.clone(),
            active.clone(),
            sessions.clone(),
        ));
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    settings: Arc<dyn SettingsService>,
    active: ActiveDestinations,
    sessions: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = sessions.cancelled() => return,
        res = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)) => res,
    };

    let mut tls = match handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!("TLS handshake with {} timed out", peer);
            return;
        }
    };

    // Read per session so a changed download folder applies immediately
    let download_root = match settings.get() {
        Ok(current) => current.download_folder,
        Err(e) => {
            tracing::error!("Cannot read settings for session from {}: {}", peer, e);
            return;
        }
    };

    match receive_session(&mut tls, &download_root, &active, &sessions).await {
        SessionOutcome::Completed { destination, bytes } => {
            tracing::info!("Stored {} bytes from {} at {:?}", bytes, peer, destination);
        }
        SessionOutcome::Cancelled { destination } => {
            tracing::info!("Session from {} cancelled (partial file {:?})", peer, destination);
        }
        SessionOutcome::Errored(e) => {
            tracing::error!("Session from {} failed: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettings;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_options() -> TransferProtocolOptions {
        TransferProtocolOptions {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_releases() {
        let host = ReceiverHost::new(
            loopback_options(),
            Arc::new(MemorySettings::default()),
            ServerIdentity::generate().unwrap(),
        )
        .unwrap();

        let first = host.start().await.unwrap();
        let second = host.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(host.local_addr().await, Some(first));

        host.stop(&CancellationToken::new()).await.unwrap();
        assert!(host.local_addr().await.is_none());
        // Stopping twice is harmless
        host.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disposed_host_cannot_restart() {
        let host = ReceiverHost::new(
            loopback_options(),
            Arc::new(MemorySettings::default()),
            ServerIdentity::generate().unwrap(),
        )
        .unwrap();

        assert!(host.fingerprint().await.is_some());
        host.start().await.unwrap();
        host.dispose().await.unwrap();

        assert!(host.fingerprint().await.is_none());
        assert!(matches!(
            host.start().await,
            Err(TransferError::Settings(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_with_cancelled_token_aborts_idle_session() {
        let host = ReceiverHost::new(
            loopback_options(),
            Arc::new(MemorySettings::default()),
            ServerIdentity::generate().unwrap(),
        )
        .unwrap();
        let addr = host.start().await.unwrap();

        // A raw TCP peer that never starts TLS keeps its handler busy
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            host.stop(&cancel).await,
            Err(TransferError::Cancelled)
        ));
    }
}
