use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::Application;

/// A unit of installation grouping one or more applications and services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: String,
    pub version: String,
    /// None for synthesized legacy packages
    pub folder_path: Option<PathBuf>,
    pub app_ids: Vec<String>,
    pub service_ids: Vec<String>,
    pub account_ids: Vec<String>,
    /// Block-rounded installed size in bytes, from the package manifest
    pub installed_size: u64,
    /// Filesystem block size `installed_size` was computed against
    pub block_size: u64,
    pub legacy: bool,
    pub read_only: bool,
}

impl Package {
    /// Packages for single-app installs that shipped without a package descriptor.
    pub fn synthesize_legacy(app: &Application) -> Self {
        Self {
            id: app.id.clone(),
            version: app.version.clone(),
            folder_path: None,
            app_ids: vec![app.id.clone()],
            service_ids: Vec::new(),
            account_ids: Vec::new(),
            installed_size: 0,
            block_size: 0,
            legacy: true,
            read_only: app.read_only,
        }
    }

    pub fn is_single_app(&self) -> bool {
        self.app_ids.len() == 1 && self.service_ids.is_empty()
    }

    pub fn contains_app(&self, app_id: &str) -> bool {
        self.app_ids.iter().any(|id| id == app_id)
    }

    /// Fields whose change calls for a manifest recompute
    pub fn same_install(&self, other: &Package) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.app_ids == other.app_ids
            && self.service_ids == other.service_ids
    }
}

/// Service descriptor; opaque beyond id and ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub package_id: String,
    pub folder_path: PathBuf,
    pub descriptor: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_package_is_single_app() {
        let app = Application::new("com.example.clock", "Clock");
        let pkg = Package::synthesize_legacy(&app);
        assert!(pkg.legacy);
        assert!(pkg.is_single_app());
        assert!(pkg.contains_app("com.example.clock"));
        assert_eq!(pkg.version, app.version);
    }
}
