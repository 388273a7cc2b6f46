//! # Persisted State
//!
//! Everything the manager keeps on disk besides the descriptor files it
//! scans:
//!
//! - dynamic launch points, one JSON file per id ([`LaunchPointStore`])
//! - the hidden-apps list ([`hidden`])
//! - per-package size manifests ([`ManifestStore`])
//!
//! plus the filesystem queries ([`fs_info`]) and the directory size walk
//! ([`SizeCalculator`]) the manifests are built from. Writes go through a
//! temporary file in the target directory and a rename.

pub mod fs_info;
pub mod hidden;
pub mod launch_points;
pub mod manifest;
pub mod sizing;

pub use fs_info::FilesystemSpace;
pub use launch_points::LaunchPointStore;
pub use manifest::{ManifestStore, PackageManifest};
pub use sizing::{PackageSize, SizeCalculator, round_to_block};

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed JSON at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Filesystem query failed at {path}: {source}")]
    Stat { path: PathBuf, source: nix::Error },
    #[error("Directory walk failed under {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("Storage unavailable: {0}")]
    Unavailable(PathBuf),
    #[error("Background task failed: {0}")]
    Join(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub(crate) async fn read_json<T>(path: &Path) -> StorageResult<Option<T>>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|source| StorageError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `value` as pretty JSON through a temporary file and a rename.
pub(crate) async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).await.map_err(io_error(dir))?;

    let temp_file = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    let (std_file, temp_path) = temp_file.into_parts();
    let mut file = fs::File::from_std(std_file);
    file.write_all(&data).await.map_err(io_error(path))?;
    file.flush().await.map_err(io_error(path))?;
    drop(file);
    temp_path
        .persist(path)
        .map_err(|e| io_error(path)(e.error))?;
    Ok(())
}

/// Remove a file. A missing file is `Ok(false)`.
pub(crate) async fn remove_file(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        assert!(read_json::<Vec<String>>(&path).await.unwrap().is_none());
        write_json(&path, &vec!["a".to_string()]).await.unwrap();
        let read: Vec<String> = read_json(&path).await.unwrap().unwrap();
        assert_eq!(read, vec!["a".to_string()]);

        assert!(remove_file(&path).await.unwrap());
        assert!(!remove_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = read_json::<Vec<String>>(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }
}
