//! Filesystem queries used for space checks and size rounding.

use std::{
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::sys::statvfs::statvfs;
use serde::Serialize;

use super::{StorageError, StorageResult, io_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpace {
    /// Preferred I/O block size, used to round file sizes
    pub block_size: u64,
    /// Unit of `free_blocks`
    pub fragment_size: u64,
    /// Blocks available to unprivileged users
    pub free_blocks: u64,
    pub device: u64,
}

impl FilesystemSpace {
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.saturating_mul(self.fragment_size)
    }

    pub fn free_kb(&self) -> u64 {
        self.free_bytes() / 1024
    }

    pub fn same_filesystem(&self, other: &FilesystemSpace) -> bool {
        self.device == other.device
    }
}

/// `path` itself or its closest existing ancestor. Download and install
/// targets often do not exist before the first install.
pub fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[allow(clippy::unnecessary_cast)]
pub fn query(path: &Path) -> StorageResult<FilesystemSpace> {
    let target = nearest_existing(path);
    let stat = statvfs(&target).map_err(|source| StorageError::Stat {
        path: target.clone(),
        source,
    })?;
    let metadata = std::fs::metadata(&target).map_err(io_error(&target))?;
    Ok(FilesystemSpace {
        block_size: stat.block_size() as u64,
        fragment_size: (stat.fragment_size() as u64).max(1),
        free_blocks: stat.blocks_available() as u64,
        device: metadata.dev(),
    })
}

/// Storage is usable when the path is an existing, writable directory.
pub fn validate_storage(path: &Path) -> StorageResult<()> {
    let metadata =
        std::fs::metadata(path).map_err(|_| StorageError::Unavailable(path.to_path_buf()))?;
    if !metadata.is_dir() || metadata.permissions().readonly() {
        return Err(StorageError::Unavailable(path.to_path_buf()));
    }
    Ok(())
}
