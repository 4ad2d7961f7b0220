use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use lanshare_core::activation::apply_activation;
use lanshare_core::discovery::{LocalDeviceScanner, remember_scanned};
use lanshare_core::transfer::utils::format_transfer_speed;
use lanshare_core::transfer::{
    ReceiverHost, TRANSFER_PORT, TlsTransferClient, TransferOrchestrator, TransferProtocolOptions,
};
use lanshare_core::{
    AppSettings, CertificateStore, JsonSettingsStore, SettingsService, TransferError,
    TransferProgressSnapshot, TransferQueueItem, TrustStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(about = "Send files to devices on the local network over TLS", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept incoming files until Ctrl+C
    Receive {
        #[arg(short, long, default_value_t = TRANSFER_PORT)]
        port: u16,
        /// Store files here instead of the configured download folder
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },
    /// Send files and folders to a receiver
    Send {
        /// Receiver address
        target: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Concurrent file sessions (defaults to the saved setting)
        #[arg(long)]
        parallel: Option<usize>,
        #[arg(short, long, default_value_t = TRANSFER_PORT)]
        port: u16,
    },
    /// Look for reachable devices on the local /24 networks
    Scan {
        #[arg(short, long, default_value_t = TRANSFER_PORT)]
        port: u16,
    },
    /// Inspect or revoke pinned receiver certificates
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
    /// Handle a lanshare:// activation link
    Open { link: String },
}

#[derive(Subcommand)]
enum TrustAction {
    List,
    Remove { peer: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Already installed is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let settings: Arc<dyn SettingsService> = Arc::new(
        JsonSettingsStore::at_default_location().context("Failed to locate settings")?,
    );

    match cli.command {
        Commands::Receive { port, download_dir } => receive(settings, port, download_dir).await,
        Commands::Send {
            target,
            paths,
            parallel,
            port,
        } => send(settings, &target, &paths, parallel, port).await,
        Commands::Scan { port } => scan(settings, port).await,
        Commands::Trust { action } => trust(settings, action),
        Commands::Open { link } => {
            if apply_activation(settings.as_ref(), &[link.as_str()])? {
                let current = settings.get()?;
                println!(
                    "Selected target {}",
                    current.last_selected_target.unwrap_or_default()
                );
            } else {
                bail!("Not a lanshare:// link: {}", link);
            }
            Ok(())
        }
    }
}

async fn receive(
    settings: Arc<dyn SettingsService>,
    port: u16,
    download_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(dir) = download_dir {
        settings.update(&mut |s: &mut AppSettings| s.download_folder = dir.clone())?;
    }

    let identity = CertificateStore::default_location()?
        .load_or_generate()
        .context("Failed to provision the TLS certificate")?;
    let host = ReceiverHost::new(TransferProtocolOptions::with_port(port), settings.clone(), identity)?;
    let addr = host.start().await.context("Failed to start the receiver")?;

    println!("Receiving on {}", addr);
    println!("Saving to {}", settings.get()?.download_folder.display());
    if let Some(fingerprint) = host.fingerprint().await {
        println!("Certificate fingerprint {}", fingerprint);
    }

    tokio::signal::ctrl_c().await?;
    println!("Waiting for running transfers, press Ctrl+C again to abort them");

    let abort = CancellationToken::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let stopped = host.stop(&abort).await;
    host.dispose().await?;
    match stopped {
        Ok(()) | Err(TransferError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn send(
    settings: Arc<dyn SettingsService>,
    target: &str,
    paths: &[PathBuf],
    parallel: Option<usize>,
    port: u16,
) -> anyhow::Result<()> {
    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let meta = std::fs::metadata(path).with_context(|| format!("Cannot read {}", path.display()))?;
        items.push(if meta.is_dir() {
            TransferQueueItem::folder(path)
        } else {
            TransferQueueItem::file(path)
        });
    }

    let trust = Arc::new(TrustStore::new(settings.clone())?);
    let orchestrator = TransferOrchestrator::new(
        Arc::new(TlsTransferClient::new(trust)),
        TransferProtocolOptions::with_port(port),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));

    let result = match parallel {
        Some(k) => {
            settings.update(&mut |s: &mut AppSettings| {
                s.last_selected_target = Some(target.trim().to_string())
            })?;
            orchestrator.upload(target, &items, k, tx, &cancel).await
        }
        None => {
            orchestrator
                .upload_with_settings(settings.as_ref(), target, &items, tx, &cancel)
                .await
        }
    };
    let _ = printer.await;

    match result {
        Ok(done) => {
            println!(
                "Sent {} files ({} bytes) to {}",
                done.completed_files, done.total_bytes, target
            );
            Ok(())
        }
        Err(TransferError::Cancelled) => {
            println!("Transfer cancelled");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Transfer to {} failed", target))),
    }
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<TransferProgressSnapshot>) {
    let started = Instant::now();
    while let Some(snapshot) = rx.recv().await {
        let speed = format_transfer_speed(snapshot.transferred_bytes, started.elapsed().as_secs_f64());
        eprint!(
            "\r{:>5.1}%  {}/{} files  {}  {:<40}",
            snapshot.fraction() * 100.0,
            snapshot.completed_files,
            snapshot.total_files,
            speed,
            snapshot.current_file.as_deref().unwrap_or("")
        );
    }
    eprintln!();
}

async fn scan(settings: Arc<dyn SettingsService>, port: u16) -> anyhow::Result<()> {
    let known = settings.get()?.previously_scanned_addresses;
    let scanner = LocalDeviceScanner::new(&TransferProtocolOptions::with_port(port));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let devices = match scanner.scan(&known, &cancel).await {
        Ok(devices) => devices,
        Err(TransferError::Cancelled) => {
            println!("Scan cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if devices.is_empty() {
        println!("No devices found");
    }
    for device in &devices {
        println!("{}", device.display_name);
    }

    if let Err(e) = remember_scanned(settings.as_ref(), &devices) {
        tracing::warn!("Could not remember scanned devices: {}", e);
    }
    Ok(())
}

fn trust(settings: Arc<dyn SettingsService>, action: TrustAction) -> anyhow::Result<()> {
    let store = TrustStore::new(settings)?;
    match action {
        TrustAction::List => {
            let peers = store.trusted_peers();
            if peers.is_empty() {
                println!("No trusted peers");
            }
            for peer in peers {
                println!("{:<16} {}", peer.peer_id, peer.fingerprint);
            }
        }
        TrustAction::Remove { peer } => {
            store.remove_trust(&peer)?;
            println!("Removed trust for {}", peer.trim());
        }
    }
    Ok(())
}
