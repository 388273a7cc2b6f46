//! # Routing Table
//!
//! Answers "which application handles this resource". Two keyed tables are
//! kept side by side:
//!
//! - resources, keyed by lowercase mime type
//! - redirects, keyed by URL pattern (a regular expression)
//!
//! Every key maps to a [`HandlerNode`] holding one primary handler and an
//! ordered list of alternates. A flat [`ExtensionMap`] translates file
//! extensions to mime types for lookups that arrive keyed by extension.
//!
//! A lookup miss is not an error: resolve operations return `Option`.

pub mod extension;
pub mod index;
pub mod node;
pub mod table;

pub use extension::ExtensionMap;
pub use index::IndexAllocator;
pub use node::{Handler, HandlerKind, HandlerNode, VerbCacheEntry};
pub use table::{HandlerRegistration, HandlerSummary, Resolution, RoutingSnapshot, RoutingTable};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Invalid URL pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("No handler node for key '{0}'")]
    NodeNotFound(String),
    #[error("No handler with index {index} under '{key}'")]
    IndexNotFound { key: String, index: u32 },
    #[error("{app_id} has no handler under '{key}'")]
    HandlerNotFound { key: String, app_id: String },
    #[error("Routing table is inconsistent: {0}")]
    Inconsistent(String),
    #[error("Routing table I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Routing table at {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type RoutingResult<T> = Result<T, RoutingError>;
