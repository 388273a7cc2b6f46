use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PackageSize, StorageResult, read_json, remove_file, write_json};

/// Cached size computation for one package, keyed by the descriptor version
/// and installer version it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub package_id: String,
    pub descriptor_version: String,
    pub installer_version: String,
    pub real_bytes: u64,
    pub block_size: u64,
    pub rounded_bytes: u64,
    pub computed_at: DateTime<Utc>,
}

impl PackageManifest {
    pub fn new(
        package_id: &str,
        descriptor_version: &str,
        installer_version: &str,
        size: PackageSize,
    ) -> Self {
        Self {
            package_id: package_id.to_string(),
            descriptor_version: descriptor_version.to_string(),
            installer_version: installer_version.to_string(),
            real_bytes: size.real_bytes,
            block_size: size.block_size,
            rounded_bytes: size.rounded_bytes,
            computed_at: Utc::now(),
        }
    }

    pub fn is_valid_for(
        &self,
        descriptor_version: &str,
        installer_version: &str,
        block_size: u64,
    ) -> bool {
        self.descriptor_version == descriptor_version
            && self.installer_version == installer_version
            && self.block_size == block_size
    }
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, package_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", package_id))
    }

    pub async fn load(&self, package_id: &str) -> StorageResult<Option<PackageManifest>> {
        read_json(&self.path_for(package_id)).await
    }

    pub async fn save(&self, manifest: &PackageManifest) -> StorageResult<()> {
        write_json(&self.path_for(&manifest.package_id), manifest).await
    }

    pub async fn delete(&self, package_id: &str) -> StorageResult<bool> {
        remove_file(&self.path_for(package_id)).await
    }
}
