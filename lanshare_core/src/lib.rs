use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod activation;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod transfer;
pub mod trust;

pub use config::{AppSettings, JsonSettingsStore, MemorySettings, SettingsService, TrustedPeer};
pub use error::{ErrorKind, Result, TransferError};
pub use identity::{CertificateStore, ServerIdentity};
pub use trust::{TofuServerVerifier, TrustStore};

/// A reachable peer found by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip_address: String,
    pub display_name: String,
}

impl DeviceInfo {
    /// Devices are named by their address until something better is known
    pub fn from_address(ip_address: impl Into<String>) -> Self {
        let ip_address = ip_address.into();
        Self {
            display_name: ip_address.clone(),
            ip_address,
        }
    }
}

/// One file to send, as resolved from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransferFile {
    pub source_path: PathBuf,
    /// Forward-slash separated path recreated under the receiver's download folder
    pub relative_path: String,
    /// Size at resolution time
    pub length: u64,
}

/// Entry of the user's send queue. Folders may carry children when the UI
/// lets the user pick inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQueueItem {
    pub display_name: String,
    pub full_path: PathBuf,
    pub is_folder: bool,
    #[serde(default = "selected_by_default")]
    pub is_selected: bool,
    /// Overrides the name the item gets on the receiver
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub children: Vec<TransferQueueItem>,
}

fn selected_by_default() -> bool {
    true
}

impl TransferQueueItem {
    /// Selected file entry named after the last path component
    pub fn file(full_path: impl Into<PathBuf>) -> Self {
        Self::new(full_path.into(), false)
    }

    /// Selected folder entry named after the last path component
    pub fn folder(full_path: impl Into<PathBuf>) -> Self {
        Self::new(full_path.into(), true)
    }

    fn new(full_path: PathBuf, is_folder: bool) -> Self {
        let display_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| full_path.display().to_string());
        Self {
            display_name,
            full_path,
            is_folder,
            is_selected: true,
            relative_path: None,
            children: Vec::new(),
        }
    }

    /// Top-most selected items of a tree. A selected item stands for its
    /// whole subtree; unselected items are looked through.
    pub fn selected_roots(items: &[TransferQueueItem]) -> Vec<TransferQueueItem> {
        let mut roots = Vec::new();
        for item in items {
            if item.is_selected {
                roots.push(item.clone());
            } else {
                roots.extend(Self::selected_roots(&item.children));
            }
        }
        roots
    }
}

/// Aggregate upload progress. `current_file` is advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgressSnapshot {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub current_file: Option<String>,
}

impl TransferProgressSnapshot {
    /// 0.0 ..= 1.0, by bytes
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files == 0 || self.completed_files == self.total_files {
                1.0
            } else {
                0.0
            }
        } else {
            self.transferred_bytes as f64 / self.total_bytes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unselected(mut item: TransferQueueItem) -> TransferQueueItem {
        item.is_selected = false;
        item
    }

    #[test]
    fn test_selected_roots_picks_top_most() {
        let mut photos = TransferQueueItem::folder("/home/u/photos");
        photos.children = vec![TransferQueueItem::file("/home/u/photos/a.jpg")];

        let mut projects = unselected(TransferQueueItem::folder("/home/u/projects"));
        projects.children = vec![
            TransferQueueItem::folder("/home/u/projects/site"),
            unselected(TransferQueueItem::file("/home/u/projects/notes.md")),
        ];

        let roots = TransferQueueItem::selected_roots(&[photos.clone(), projects]);
        let names: Vec<&str> = roots.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, vec!["photos", "site"]);
        // The selected folder keeps its subtree
        assert_eq!(roots[0].children.len(), 1);
    }

    #[test]
    fn test_queue_item_json_defaults() {
        let item: TransferQueueItem = serde_json::from_str(
            r#"{"display_name":"a.txt","full_path":"/tmp/a.txt","is_folder":false}"#,
        )
        .unwrap();
        assert!(item.is_selected);
        assert!(item.children.is_empty());
        assert!(item.relative_path.is_none());
    }

    #[test]
    fn test_progress_fraction() {
        let empty = TransferProgressSnapshot::default();
        assert_eq!(empty.fraction(), 1.0);

        let half = TransferProgressSnapshot {
            total_files: 2,
            completed_files: 1,
            total_bytes: 10,
            transferred_bytes: 5,
            current_file: None,
        };
        assert_eq!(half.fraction(), 0.5);
        assert_eq!(DeviceInfo::from_address("10.0.0.2").display_name, "10.0.0.2");
    }
}
