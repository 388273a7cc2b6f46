//! # Descriptor Model
//!
//! Records for everything the manager knows about: [`Application`],
//! [`Package`], [`Service`] and [`LaunchPoint`]. Records are created from
//! descriptor files on disk by [`loader`] and owned by the
//! [`DescriptorStore`](crate::store::DescriptorStore); everything else refers
//! to them by id.

pub mod application;
pub mod launch_point;
pub mod loader;
pub mod package;

pub use application::{
    AppKind, AppStatus, Application, HardwareFeatures, MergeOutcome, RedirectRegistration,
    ResourceRegistration,
};
pub use launch_point::LaunchPoint;
pub use loader::{LoadContext, load_application, load_package, load_service};
pub use package::{Package, Service};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("No descriptor found in {folder}")]
    NotFound { folder: PathBuf },

    #[error("Failed to read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Descriptor {path} is missing required field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("App id {id} does not match its folder {folder}")]
    FolderMismatch { id: String, folder: PathBuf },
}

impl DescriptorError {
    /// Parse failures and validation failures are both non-fatal to a scan,
    /// but are reported differently.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DescriptorError::MissingField { .. } | DescriptorError::FolderMismatch { .. }
        )
    }
}

pub type DescriptorResult<T> = Result<T, DescriptorError>;
