//! Installed-size computation.
//!
//! The canonical size of a package is a recursive walk of its install
//! directories (symlinks not followed) that sums the real byte length of
//! every regular file and, separately, each length rounded up to the
//! filesystem block size.
//!
//! The walk accumulates into a single [`SizeScratch`] owned by the
//! [`SizeCalculator`]; holding its lock for the whole walk means only one
//! computation is in flight at a time. Walks run on the blocking pool.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{StorageError, StorageResult};

/// `len` rounded up to a whole number of `block_size` blocks.
pub fn round_to_block(len: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return len;
    }
    len.div_ceil(block_size).saturating_mul(block_size)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSize {
    pub real_bytes: u64,
    pub rounded_bytes: u64,
    pub block_size: u64,
    pub files: u64,
}

impl PackageSize {
    pub fn rounded_kb(&self) -> u64 {
        self.rounded_bytes.div_ceil(1024)
    }
}

/// Accumulator for one walk
#[derive(Debug, Default)]
pub struct SizeScratch {
    real_bytes: u64,
    rounded_bytes: u64,
    files: u64,
}

impl SizeScratch {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn add_file(&mut self, len: u64, block_size: u64) {
        self.real_bytes = self.real_bytes.saturating_add(len);
        self.rounded_bytes = self
            .rounded_bytes
            .saturating_add(round_to_block(len, block_size));
        self.files += 1;
    }

    fn walk(&mut self, root: &Path, block_size: u64) -> StorageResult<()> {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|source| StorageError::Walk {
                path: root.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(|source| StorageError::Walk {
                path: entry.path().to_path_buf(),
                source,
            })?;
            self.add_file(metadata.len(), block_size);
        }
        Ok(())
    }

    fn result(&self, block_size: u64) -> PackageSize {
        PackageSize {
            real_bytes: self.real_bytes,
            rounded_bytes: self.rounded_bytes,
            block_size,
            files: self.files,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SizeCalculator {
    scratch: Arc<Mutex<SizeScratch>>,
}

impl SizeCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of everything under `roots`. Missing roots count as empty.
    #[instrument(skip(self), level = "debug")]
    pub async fn measure(&self, roots: Vec<PathBuf>, block_size: u64) -> StorageResult<PackageSize> {
        let mut scratch = self.scratch.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            scratch.reset();
            for root in roots.iter().filter(|r| r.exists()) {
                scratch.walk(root, block_size)?;
            }
            let size = scratch.result(block_size);
            debug!("measured {:?}: {:?}", roots, size);
            Ok::<_, StorageError>(size)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }

    /// A computation currently holds the scratch accumulator
    pub fn is_busy(&self) -> bool {
        self.scratch.try_lock().is_err()
    }
}
