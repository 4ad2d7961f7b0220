use crate::error::{Result, TransferError};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};

/// Turn a wire path into a relative local path.
///
/// Both separators are accepted. `.` segments vanish and `..` pops the previous
/// segment; popping past the start, a leading separator or a drive prefix is an
/// escape attempt.
pub fn normalize_relative_path(relative: &str) -> Result<PathBuf> {
    let unified = relative.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(TransferError::PathEscape(relative.to_string()));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(TransferError::PathEscape(relative.to_string()));
                }
            }
            name => {
                let plain = Path::new(name)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
                if !plain {
                    return Err(TransferError::PathEscape(relative.to_string()));
                }
                segments.push(name);
            }
        }
    }

    if segments.is_empty() {
        return Err(TransferError::protocol(format!(
            "Manifest path {:?} names no file",
            relative
        )));
    }

    Ok(segments.iter().collect())
}

/// Resolve `relative` beneath `root`, refusing anything that lands outside it.
///
/// The root is created if needed. Symlinks already present under the root are
/// followed before the containment check. Nothing is created below the root.
pub async fn resolve_destination(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = normalize_relative_path(relative)?;

    tokio::fs::create_dir_all(root).await?;
    let canonical_root = tokio::fs::canonicalize(root).await?;
    let destination = canonical_root.join(&relative);

    // Deepest ancestor that already exists decides where the file really goes
    let mut existing = destination.as_path();
    loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(resolved) => {
                if !resolved.starts_with(&canonical_root) {
                    return Err(TransferError::PathEscape(
                        relative.to_string_lossy().into_owned(),
                    ));
                }
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                existing = match existing.parent() {
                    Some(parent) => parent,
                    None => break,
                };
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(destination)
}

/// Create (or truncate) a file with secure permissions (0o600 on Unix)
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Human readable throughput
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_and_nested() {
        assert_eq!(
            normalize_relative_path("a.txt").unwrap(),
            PathBuf::from("a.txt")
        );
        assert_eq!(
            normalize_relative_path("source/nested/b.txt").unwrap(),
            Path::new("source").join("nested").join("b.txt")
        );
        assert_eq!(
            normalize_relative_path("source\\nested\\b.txt").unwrap(),
            Path::new("source").join("nested").join("b.txt")
        );
        assert_eq!(
            normalize_relative_path("./source//x/../b.txt").unwrap(),
            Path::new("source").join("b.txt")
        );
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        for bad in [
            "../../evil.txt",
            "..\\..\\evil.txt",
            "folder/../../evil.txt",
            "/etc/passwd",
            "\\Windows\\System32\\cmd.exe",
        ] {
            assert!(
                matches!(
                    normalize_relative_path(bad),
                    Err(TransferError::PathEscape(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(matches!(
            normalize_relative_path(""),
            Err(TransferError::Protocol(_))
        ));
        assert!(matches!(
            normalize_relative_path("./"),
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_destination_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");

        let path = resolve_destination(&root, "source/nested/b.txt")
            .await
            .unwrap();
        let canonical_root = tokio::fs::canonicalize(&root).await.unwrap();
        assert!(path.starts_with(&canonical_root));
        assert!(path.ends_with(Path::new("source").join("nested").join("b.txt")));
        // Only the root itself is created
        assert!(!canonical_root.join("source").exists());
    }

    #[tokio::test]
    async fn test_resolve_destination_rejects_escape_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");

        let result = resolve_destination(&root, "../../evil.txt").await;
        assert!(matches!(result, Err(TransferError::PathEscape(_))));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_destination_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let result = resolve_destination(&root, "link/evil.txt").await;
        assert!(matches!(result, Err(TransferError::PathEscape(_))));
    }

    #[tokio::test]
    async fn test_open_secure_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("secure.txt");
        tokio::fs::write(&file_path, b"previous content").await.unwrap();

        let _file = open_secure_file(&file_path)
            .await
            .expect("Failed to open secure file");
        assert_eq!(tokio::fs::metadata(&file_path).await.unwrap().len(), 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // A freshly created file gets 0o600
            let fresh = dir.path().join("fresh.txt");
            let _fresh = open_secure_file(&fresh).await.unwrap();
            let mode = tokio::fs::metadata(&fresh).await.unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(10, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(500, 1.0), "500 B/s");
        assert_eq!(format_transfer_speed(2_500, 1.0), "2.5 KB/s");
        assert_eq!(format_transfer_speed(3_000_000, 1.0), "3.00 MB/s");
    }
}
