//! Turns a send queue into individual uploads.
//!
//! Every file travels in its own session. At most `max_parallel` sessions run
//! at once and all of them feed one [`ProgressAggregator`].

use crate::config::{AppSettings, SettingsService};
use crate::error::{Result, TransferError};
use crate::{ResolvedTransferFile, TransferProgressSnapshot, TransferQueueItem};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::constants::TransferProtocolOptions;
use super::sender::TransferClient;

/// Flatten queue items into the files they stand for.
///
/// A file becomes one entry named after itself. A folder becomes every file
/// beneath it, prefixed with the folder name. Paths that no longer exist are
/// skipped.
pub fn resolve_files(items: &[TransferQueueItem]) -> Vec<ResolvedTransferFile> {
    let mut files = Vec::new();

    for item in items {
        let path = item.full_path.as_path();

        if !item.is_folder {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    let name = item
                        .relative_path
                        .clone()
                        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .unwrap_or_else(|| item.display_name.clone());
                    files.push(ResolvedTransferFile {
                        source_path: path.to_path_buf(),
                        relative_path: name.replace('\\', "/"),
                        length: meta.len(),
                    });
                }
                _ => tracing::debug!("Skipping missing file {:?}", path),
            }
            continue;
        }

        if !path.is_dir() {
            tracing::debug!("Skipping missing folder {:?}", path);
            continue;
        }

        let prefix = item
            .relative_path
            .clone()
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| item.display_name.clone())
            .replace('\\', "/");
        let prefix = prefix.trim_end_matches('/');

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry under {:?}: {}", path, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let length = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    tracing::debug!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let inner = match entry.path().strip_prefix(path) {
                Ok(inner) => forward_slashed(inner),
                Err(_) => continue,
            };

            files.push(ResolvedTransferFile {
                source_path: entry.path().to_path_buf(),
                relative_path: format!("{}/{}", prefix, inner),
                length,
            });
        }
    }

    files
}

fn forward_slashed(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Shared upload counters.
///
/// Snapshots are built and sent under one lock so the receiving side sees
/// counters that never go backwards.
pub struct ProgressAggregator {
    total_files: usize,
    total_bytes: u64,
    completed_files: AtomicUsize,
    transferred_bytes: AtomicU64,
    emit_lock: Mutex<()>,
    tx: mpsc::UnboundedSender<TransferProgressSnapshot>,
}

impl ProgressAggregator {
    pub fn new(
        total_files: usize,
        total_bytes: u64,
        tx: mpsc::UnboundedSender<TransferProgressSnapshot>,
    ) -> Self {
        Self {
            total_files,
            total_bytes,
            completed_files: AtomicUsize::new(0),
            transferred_bytes: AtomicU64::new(0),
            emit_lock: Mutex::new(()),
            tx,
        }
    }

    /// Count `bytes` of `current_file`, never past the resolved total
    pub fn add_bytes(&self, bytes: u64, current_file: &str) {
        let _guard = self.lock();
        let total = self.total_bytes;
        let _ = self
            .transferred_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                Some(done.saturating_add(bytes).min(total))
            });
        self.send(Some(current_file));
    }

    pub fn complete_file(&self, current_file: &str) {
        let _guard = self.lock();
        let total = self.total_files;
        let _ = self
            .completed_files
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                Some((done + 1).min(total))
            });
        self.send(Some(current_file));
    }

    /// Emit the current counters without a file name
    pub fn emit(&self) -> TransferProgressSnapshot {
        let _guard = self.lock();
        self.send(None)
    }

    /// Mark everything done and emit the final snapshot
    pub fn finish(&self) -> TransferProgressSnapshot {
        let _guard = self.lock();
        self.completed_files
            .store(self.total_files, Ordering::SeqCst);
        self.transferred_bytes
            .store(self.total_bytes, Ordering::SeqCst);
        self.send(None)
    }

    pub fn snapshot(&self, current_file: Option<&str>) -> TransferProgressSnapshot {
        TransferProgressSnapshot {
            total_files: self.total_files,
            completed_files: self.completed_files.load(Ordering::SeqCst),
            total_bytes: self.total_bytes,
            transferred_bytes: self.transferred_bytes.load(Ordering::SeqCst),
            current_file: current_file.map(str::to_string),
        }
    }

    fn send(&self, current_file: Option<&str>) -> TransferProgressSnapshot {
        let snapshot = self.snapshot(current_file);
        // A dropped receiver only means nobody is watching
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.emit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct TransferOrchestrator {
    client: Arc<dyn TransferClient>,
    options: TransferProtocolOptions,
}

impl TransferOrchestrator {
    pub fn new(client: Arc<dyn TransferClient>, options: TransferProtocolOptions) -> Self {
        Self { client, options }
    }

    /// Send every file behind `items` to `target`.
    ///
    /// A failing file does not stop the others. Once every file has been
    /// attempted the first failure is returned. A send interrupted by `cancel`
    /// makes the whole upload [`TransferError::Cancelled`], while a cancel
    /// arriving after every file completed changes nothing.
    pub async fn upload(
        &self,
        target: &str,
        items: &[TransferQueueItem],
        max_parallel: usize,
        progress: mpsc::UnboundedSender<TransferProgressSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<TransferProgressSnapshot> {
        let owned_items = items.to_vec();
        let files = match tokio::task::spawn_blocking(move || resolve_files(&owned_items)).await {
            Ok(files) => files,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(TransferError::Cancelled),
        };

        let total_bytes = files.iter().map(|f| f.length).sum();
        let aggregator = Arc::new(ProgressAggregator::new(files.len(), total_bytes, progress));
        aggregator.emit();

        tracing::info!(
            "Uploading {} files ({} bytes) to {} with {} parallel sessions",
            files.len(),
            total_bytes,
            target,
            max_parallel.max(1)
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for file in files {
            let client = self.client.clone();
            let aggregator = aggregator.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let target = target.to_string();
            let port = self.options.port;

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| TransferError::Cancelled)?
                    }
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                };

                let on_bytes = |bytes: u64| aggregator.add_bytes(bytes, &file.relative_path);
                client
                    .send_file(&target, port, &file, &on_bytes, &cancel)
                    .await?;

                aggregator.complete_file(&file.relative_path);
                Ok::<(), TransferError>(())
            });
        }

        let mut first_error: Option<TransferError> = None;
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => cancelled = true,
                Ok(Err(e)) => {
                    tracing::error!("Upload to {} failed: {}", target, e);
                    first_error.get_or_insert(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => cancelled = true,
            }
        }

        if cancelled {
            return Err(TransferError::Cancelled);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let done = aggregator.finish();
        tracing::info!("Upload to {} finished: {} files", target, done.completed_files);
        Ok(done)
    }

    /// [`upload`](Self::upload) with the parallelism from settings. The target
    /// is remembered as the last selected one.
    pub async fn upload_with_settings(
        &self,
        settings: &dyn SettingsService,
        target: &str,
        items: &[TransferQueueItem],
        progress: mpsc::UnboundedSender<TransferProgressSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<TransferProgressSnapshot> {
        let target = target.trim();
        let current = settings.get()?;

        let remembered = target.to_string();
        if let Err(e) = settings.update(&mut |s: &mut AppSettings| {
            s.last_selected_target = Some(remembered.clone());
        }) {
            tracing::warn!("Could not remember target {}: {}", target, e);
        }

        self.upload(
            target,
            items,
            current.max_parallel_uploads,
            progress,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_resolve_folder_and_file() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("source/a.txt"), b"aaa");
        write(&dir.path().join("source/nested/b.txt"), b"bbbbb");
        write(&dir.path().join("single.bin"), b"z");

        let files = resolve_files(&[
            TransferQueueItem::folder(dir.path().join("source")),
            TransferQueueItem::file(dir.path().join("single.bin")),
            TransferQueueItem::file(dir.path().join("missing.txt")),
            TransferQueueItem::folder(dir.path().join("missing-dir")),
        ]);

        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["source/a.txt", "source/nested/b.txt", "single.bin"]);
        assert_eq!(files.iter().map(|f| f.length).sum::<u64>(), 9);
    }

    #[test]
    fn test_resolve_honours_relative_path_override() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("report.pdf"), b"%PDF");
        write(&dir.path().join("dir/x.txt"), b"x");

        let mut file = TransferQueueItem::file(dir.path().join("report.pdf"));
        file.relative_path = Some("docs\\2024\\report.pdf".into());
        let mut folder = TransferQueueItem::folder(dir.path().join("dir"));
        folder.relative_path = Some("renamed/".into());

        let files = resolve_files(&[file, folder]);
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["docs/2024/report.pdf", "renamed/x.txt"]);
    }

    #[test]
    fn test_aggregator_clamps_and_finishes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = ProgressAggregator::new(2, 10, tx);

        aggregator.add_bytes(6, "a");
        aggregator.add_bytes(6, "a");
        aggregator.complete_file("a");
        aggregator.complete_file("a");
        aggregator.complete_file("a");

        let last = aggregator.snapshot(None);
        assert_eq!(last.transferred_bytes, 10);
        assert_eq!(last.completed_files, 2);

        let done = aggregator.finish();
        assert_eq!(done.transferred_bytes, 10);
        assert!(done.current_file.is_none());

        let mut seen = 0;
        while let Ok(snapshot) = rx.try_recv() {
            assert!(snapshot.transferred_bytes <= snapshot.total_bytes);
            assert!(snapshot.completed_files <= snapshot.total_files);
            seen += 1;
        }
        assert_eq!(seen, 6);
    }
}
