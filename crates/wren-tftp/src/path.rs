use std::path::{Path, PathBuf};

use crate::error::{Result, TftpError};

/// Maps a client-supplied filename to a file under the session root.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, root: &Path, filename: &str) -> Result<PathBuf>;
}

/// Keeps every request inside the root directory.
///
/// Rejects `..` components, symlinks, and anything that canonicalizes to a
/// location outside the root. Leading slashes are stripped so `/boot.img`
/// and `boot.img` name the same file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootJail;

impl PathResolver for RootJail {
    fn resolve(&self, root: &Path, filename: &str) -> Result<PathBuf> {
        let filename = filename.replace('\\', "/");
        if filename.split('/').any(|part| part == "..") {
            return Err(TftpError::AccessDenied("Invalid filename".to_string()));
        }

        let relative = filename.trim_start_matches('/');
        if relative.is_empty() {
            return Err(TftpError::AccessDenied("Empty filename".to_string()));
        }

        let file_path = root.join(relative);

        match std::fs::symlink_metadata(&file_path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(TftpError::AccessDenied(
                        "Symlinks are not allowed".to_string(),
                    ));
                }
            }
            // Missing files are reported when the transfer opens them
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => {
                return Err(TftpError::AccessDenied("Access denied".to_string()));
            }
        }

        let canonical_root = root
            .canonicalize()
            .map_err(|_| TftpError::AccessDenied("Root directory error".to_string()))?;

        if let Ok(canonical_file) = file_path.canonicalize() {
            if !canonical_file.starts_with(&canonical_root) {
                return Err(TftpError::AccessDenied("Access denied".to_string()));
            }
        } else if let Some(parent) = file_path.parent()
            && let Ok(canonical_parent) = parent.canonicalize()
            && !canonical_parent.starts_with(&canonical_root)
        {
            return Err(TftpError::AccessDenied("Access denied".to_string()));
        }

        Ok(file_path)
    }
}
