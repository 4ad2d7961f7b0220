//! Finds reachable peers on the directly attached /24 networks.

use crate::DeviceInfo;
use crate::config::{AppSettings, SettingsService};
use crate::error::{Result, TransferError};
use crate::transfer::TransferProtocolOptions;
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Probes running at the same time
pub const SCAN_WORKERS: usize = 16;

/// ICMP echo wait per address
pub const PING_WAIT: Duration = Duration::from_millis(150);

/// Allowance for starting the `ping` process on top of [`PING_WAIT`]
const PING_SPAWN_GRACE: Duration = Duration::from_millis(100);

/// TCP connect budget for the transfer port probe
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Interface name fragments of VMs, containers and tunnels
const VIRTUAL_INTERFACE_MARKERS: &[&str] = &[
    "docker", "veth", "virbr", "vmnet", "vbox", "br-", "tun", "tap", "utun", "wg", "zt",
    "tailscale", "vethernet", "hyper-v", "virtual",
];

/// Decides whether a single address answers
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_reachable(&self, ip: Ipv4Addr) -> bool;
}

/// Reachable when `ping` succeeds or the transfer port accepts a connection
pub struct SystemProbe {
    port: u16,
    ping_program: PathBuf,
}

impl SystemProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ping_program: PathBuf::from("ping"),
        }
    }

    /// Run another executable in place of the `ping` found on `PATH`
    pub fn with_ping_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ping_program = program.into();
        self
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn is_reachable(&self, ip: Ipv4Addr) -> bool {
        if ping(&self.ping_program, ip).await {
            return true;
        }

        let addr = SocketAddr::new(IpAddr::V4(ip), self.port);
        matches!(
            tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

async fn ping(program: &Path, ip: Ipv4Addr) -> bool {
    let mut cmd = Command::new(program);

    #[cfg(target_os = "windows")]
    cmd.args(["-n", "1", "-w", &PING_WAIT.as_millis().to_string()]);

    #[cfg(target_os = "macos")]
    cmd.args(["-c", "1", "-W", &PING_WAIT.as_millis().to_string()]);

    // iputils rounds -W to whole seconds, the process deadline below enforces PING_WAIT
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    cmd.args(["-c", "1", "-W", "1"]);

    cmd.arg(ip.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(PING_WAIT + PING_SPAWN_GRACE, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            tracing::debug!("Cannot run {:?}: {}", program, e);
            false
        }
        Err(_) => false,
    }
}

pub struct LocalDeviceScanner {
    probe: Arc<dyn HostProbe>,
}

impl LocalDeviceScanner {
    pub fn new(options: &TransferProtocolOptions) -> Self {
        Self::with_probe(Arc::new(SystemProbe::new(options.port)))
    }

    pub fn with_probe(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }

    /// Probe every /24 neighbour plus `known` addresses.
    ///
    /// Returns reachable devices ordered by address string.
    pub async fn scan(&self, known: &[String], cancel: &CancellationToken) -> Result<Vec<DeviceInfo>> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let local = local_ipv4_addresses();
        let candidates = candidate_addresses(&local, known);
        tracing::info!(
            "Scanning {} addresses from {} local interfaces",
            candidates.len(),
            local.len()
        );

        let devices = self.probe_all(candidates, cancel).await?;
        tracing::info!("Scan found {} devices", devices.len());
        Ok(devices)
    }

    /// Run the worker pool over `candidates`
    pub async fn probe_all(
        &self,
        candidates: Vec<Ipv4Addr>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceInfo>> {
        let queue = Arc::new(Mutex::new(VecDeque::from(candidates)));
        let found = Arc::new(Mutex::new(BTreeSet::new()));
        let mut workers = JoinSet::new();

        for _ in 0..SCAN_WORKERS {
            let queue = queue.clone();
            let found = found.clone();
            let probe = self.probe.clone();
            workers.spawn(async move {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .pop_front();
                    let Some(ip) = next else { break };

                    if probe.is_reachable(ip).await {
                        tracing::debug!("{} is reachable", ip);
                        found
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(ip.to_string());
                    }
                }
            });
        }

        let drained = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                }
            }
        };

        tokio::select! {
            _ = drained => {}
            _ = cancel.cancelled() => {
                tracing::info!("Scan cancelled");
                return Err(TransferError::Cancelled);
            }
        }

        // BTreeSet keeps them distinct and in string order
        let addresses = std::mem::take(
            &mut *found
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        Ok(addresses.into_iter().map(DeviceInfo::from_address).collect())
    }
}

/// IPv4 addresses of physical, non-loopback, non-link-local interfaces
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Cannot list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut addresses = Vec::new();
    for (name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if is_scannable_interface(&name, v4) && !addresses.contains(&v4) {
                addresses.push(v4);
            } else {
                tracing::debug!("Ignoring interface {} ({})", name, v4);
            }
        }
    }
    addresses
}

pub fn is_scannable_interface(name: &str, ip: Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
        return false;
    }
    let name = name.to_lowercase();
    !VIRTUAL_INTERFACE_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
}

/// Hosts 1..=254 of each local /24 and the valid `known` addresses, minus
/// the local addresses themselves.
pub fn candidate_addresses(local: &[Ipv4Addr], known: &[String]) -> Vec<Ipv4Addr> {
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();

    for ip in local {
        let [a, b, c, _] = ip.octets();
        for host in 1..=254u8 {
            let candidate = Ipv4Addr::new(a, b, c, host);
            if !local.contains(&candidate) && seen.insert(candidate) {
                candidates.push(candidate);
            }
        }
    }

    for address in known {
        let Ok(candidate) = address.trim().parse::<Ipv4Addr>() else {
            continue;
        };
        if candidate.is_loopback() || candidate.is_unspecified() || local.contains(&candidate) {
            continue;
        }
        if seen.insert(candidate) {
            candidates.push(candidate);
        }
    }

    candidates
}

/// Merge scan results into the remembered addresses
pub fn remember_scanned(settings: &dyn SettingsService, devices: &[DeviceInfo]) -> Result<()> {
    if devices.is_empty() {
        return Ok(());
    }
    settings.update(&mut |s: &mut AppSettings| {
        s.previously_scanned_addresses
            .extend(devices.iter().map(|d| d.ip_address.clone()));
    })?;
    Ok(())
}
