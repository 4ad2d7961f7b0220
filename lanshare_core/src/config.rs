//! Settings record and the collaborator interface used to read/write it.
//!
//! The transfer components only see [`SettingsService`]. [`JsonSettingsStore`]
//! is the file-backed implementation used by the CLI; [`MemorySettings`]
//! backs embedders that persist settings their own way (and the tests).

use crate::error::{Result, TransferError};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanshare";
const APP_NAME: &str = "lanshare";
const CONFIG_FILE: &str = "settings.json";
const SETTINGS_VERSION: u32 = 2;
const DEFAULT_MAX_PARALLEL_UPLOADS: usize = 2;

/// Overrides the config directory (settings and TLS identity live there)
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

/// Certificate fingerprint pinned for one peer id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Trimmed, lower-cased network address of the peer
    pub peer_id: String,
    /// Upper-case hex SHA-256 of the peer's DER certificate
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub version: u32,
    pub download_folder: PathBuf,
    pub max_parallel_uploads: usize,
    pub last_selected_target: Option<String>,
    pub trusted_peers: Vec<TrustedPeer>,
    pub previously_scanned_addresses: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            download_folder: default_download_dir(),
            max_parallel_uploads: DEFAULT_MAX_PARALLEL_UPLOADS,
            last_selected_target: None,
            trusted_peers: Vec::new(),
            previously_scanned_addresses: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Repair values a hand-edited or older settings file may contain
    pub fn normalized(self) -> Self {
        let download_folder = if self.download_folder.as_os_str().is_empty() {
            default_download_dir()
        } else {
            self.download_folder
        };

        let last_selected_target = self
            .last_selected_target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            version: self.version.max(SETTINGS_VERSION),
            download_folder,
            max_parallel_uploads: self.max_parallel_uploads.max(1),
            last_selected_target,
            trusted_peers: normalize_trusted_peers(self.trusted_peers),
            previously_scanned_addresses: normalize_scanned_addresses(
                self.previously_scanned_addresses,
            ),
        }
    }
}

fn normalize_trusted_peers(peers: Vec<TrustedPeer>) -> Vec<TrustedPeer> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(peers.len());

    for peer in peers {
        let peer_id = peer.peer_id.trim().to_lowercase();
        let fingerprint = peer.fingerprint.trim().to_uppercase();
        if peer_id.is_empty() || fingerprint.is_empty() {
            continue;
        }
        // First entry wins, later duplicates are dropped
        if seen.insert(peer_id.clone()) {
            normalized.push(TrustedPeer {
                peer_id,
                fingerprint,
            });
        }
    }

    normalized
}

fn normalize_scanned_addresses(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .iter()
        .filter_map(|a| a.trim().parse::<Ipv4Addr>().ok())
        .map(|ip| ip.to_string())
        .filter(|ip| seen.insert(ip.clone()))
        .collect()
}

/// `get current settings` / `save settings` collaborator.
///
/// Synchronous on purpose: the trust store calls it from inside the TLS
/// certificate verifier, which cannot await.
pub trait SettingsService: Send + Sync {
    fn get(&self) -> Result<AppSettings>;

    fn save(&self, settings: &AppSettings) -> Result<()>;

    /// Read-modify-write helper.
    ///
    /// The default is not atomic. Stores shared between tasks override it so
    /// concurrent updates on the same instance cannot drop each other's changes.
    fn update(&self, apply: &mut dyn FnMut(&mut AppSettings)) -> Result<AppSettings> {
        let mut settings = self.get()?;
        apply(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

/// Settings persisted as pretty-printed JSON.
///
/// Access through one instance is serialized. Separate instances (or
/// processes) pointed at the same file are not coordinated.
pub struct JsonSettingsStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    /// `settings.json` inside [`config_dir`]
    pub fn at_default_location() -> Result<Self> {
        let dir = config_dir()
            .ok_or_else(|| TransferError::Settings("No config directory available".into()))?;
        Ok(Self::new(dir.join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_raw(&self) -> Option<AppSettings> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable settings file {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.io_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caller holds `io_lock`
    fn read_locked(&self) -> Result<AppSettings> {
        let stored = self.load_raw();
        let normalized = stored.clone().unwrap_or_default().normalized();

        if stored.as_ref() != Some(&normalized) {
            self.write_locked(&normalized)?;
        }

        Ok(normalized)
    }

    /// Caller holds `io_lock`
    fn write_locked(&self, settings: &AppSettings) -> Result<()> {
        let normalized = settings.clone().normalized();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a half-written file
        let json = serde_json::to_string_pretty(&normalized)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl SettingsService for JsonSettingsStore {
    fn get(&self) -> Result<AppSettings> {
        let _guard = self.lock();
        self.read_locked()
    }

    fn save(&self, settings: &AppSettings) -> Result<()> {
        let _guard = self.lock();
        self.write_locked(settings)
    }

    fn update(&self, apply: &mut dyn FnMut(&mut AppSettings)) -> Result<AppSettings> {
        let _guard = self.lock();
        let mut settings = self.read_locked()?;
        apply(&mut settings);
        let settings = settings.normalized();
        self.write_locked(&settings)?;
        Ok(settings)
    }
}

/// Settings kept only in memory
#[derive(Default)]
pub struct MemorySettings {
    inner: Mutex<AppSettings>,
}

impl MemorySettings {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            inner: Mutex::new(settings.normalized()),
        }
    }

    pub fn snapshot(&self) -> AppSettings {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl SettingsService for MemorySettings {
    fn get(&self) -> Result<AppSettings> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &AppSettings) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = settings.clone().normalized();
        Ok(())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut AppSettings)) -> Result<AppSettings> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut settings = guard.clone();
        apply(&mut settings);
        *guard = settings.normalized();
        Ok(guard.clone())
    }
}

/// Config directory for this app, honouring [`CONFIG_DIR_ENV`]
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Some(PathBuf::from(dir));
        }
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// `~/Downloads` (or the platform's download folder)
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| {
            dirs.download_dir()
                .map(Path::to_path_buf)
                .or_else(|| Some(dirs.home_dir().join("Downloads")))
        })
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}
