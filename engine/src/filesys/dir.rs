//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::ShipyardError;
use crate::filesys::file::File;

/// A file found while walking a directory tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walked root, `/`-separated
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ShipyardError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), ShipyardError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, ShipyardError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Walk every regular file below this directory, sorted by relative path.
    ///
    /// Symlinks are reported as files of their link size and not followed.
    pub async fn walk_files(&self) -> Result<Vec<WalkEntry>, ShipyardError> {
        let mut files = Vec::new();
        let mut stack = vec![self.path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.path)
                    .map_err(|e| ShipyardError::Internal(e.to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(WalkEntry {
                    relative,
                    path,
                    size: meta.len(),
                });
            }
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(files)
    }

    /// Recursively copy this directory into `dest`, preserving symlinks
    pub async fn copy_to(&self, dest: &Path) -> Result<u64, ShipyardError> {
        let mut copied = 0u64;
        let mut stack = vec![(self.path.clone(), dest.to_path_buf())];

        while let Some((src, dst)) = stack.pop() {
            fs::create_dir_all(&dst).await?;
            let mut entries = fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let from = entry.path();
                let to = dst.join(entry.file_name());
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push((from, to));
                } else if file_type.is_symlink() {
                    copy_symlink(&from, &to).await?;
                } else {
                    copied += fs::copy(&from, &to).await?;
                }
            }
        }

        Ok(copied)
    }
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<(), ShipyardError> {
    let target = fs::read_link(from).await?;
    let _ = fs::remove_file(to).await;
    fs::symlink(target, to).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, to: &Path) -> Result<(), ShipyardError> {
    fs::copy(from, to).await?;
    Ok(())
}
