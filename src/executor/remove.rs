//! Removal policy.
//!
//! A remove request names a package or any app inside it. What actually
//! happens depends on the apps in that package:
//!
//! - every app lives on a read-only root: shallow remove, bookkeeping only,
//!   and the apps are added to the hidden list so a rescan keeps them out
//! - a non-removable, user-hideable app alone in its package: hidden instead
//!   of removed
//! - any other non-removable app: refused
//! - otherwise the packaging tool removes the package and its folders are
//!   deleted

use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use super::{ExecutorError, ExecutorResult};
use crate::store::DescriptorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RemoveMode {
    Full,
    Shallow,
    HideOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePlan {
    pub package_id: String,
    pub version: String,
    pub app_ids: Vec<String>,
    pub service_ids: Vec<String>,
    /// Working directory of the pre-remove script
    pub folder: Option<PathBuf>,
    /// Deleted after the tool ran. Empty unless the mode is `Full`.
    pub install_dirs: Vec<PathBuf>,
    pub mode: RemoveMode,
}

pub fn plan_removal(store: &DescriptorStore, package_or_app_id: &str) -> ExecutorResult<RemovePlan> {
    let package = store
        .resolve_package(package_or_app_id)
        .ok_or_else(|| ExecutorError::NotFound(package_or_app_id.to_string()))?;

    let apps: Vec<_> = package
        .app_ids
        .iter()
        .filter_map(|id| store.app(id))
        .collect();

    let all_read_only = !apps.is_empty() && apps.iter().all(|app| app.read_only);
    let blocking = apps.iter().find(|app| !app.removable);

    let mode = if all_read_only || (apps.is_empty() && package.read_only) {
        RemoveMode::Shallow
    } else if let Some(app) = blocking {
        if app.user_hideable && package.is_single_app() {
            RemoveMode::HideOnly
        } else {
            warn!(
                "refusing removal of {}: {} is not removable",
                package.id, app.id
            );
            return Err(ExecutorError::RemovalRefused {
                package_id: package.id.clone(),
                app_id: app.id.clone(),
            });
        }
    } else {
        RemoveMode::Full
    };

    let folder = package
        .folder_path
        .clone()
        .or_else(|| apps.first().map(|app| app.folder_path.clone()));

    let install_dirs = if mode == RemoveMode::Full {
        let mut dirs: Vec<PathBuf> = apps.iter().map(|app| app.folder_path.clone()).collect();
        dirs.extend(
            package
                .service_ids
                .iter()
                .filter_map(|id| store.service(id))
                .map(|service| service.folder_path.clone()),
        );
        dirs.extend(package.folder_path.clone());
        dirs.retain(|d| !d.as_os_str().is_empty());
        dirs.dedup();
        dirs
    } else {
        Vec::new()
    };

    Ok(RemovePlan {
        package_id: package.id.clone(),
        version: package.version.clone(),
        app_ids: package.app_ids.clone(),
        service_ids: package.service_ids.clone(),
        folder,
        install_dirs,
        mode,
    })
}
