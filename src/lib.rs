//! # appmgr: Application Lifecycle and Resource Routing
//!
//! appmgr is the on-device application manager of a mobile shell. It discovers
//! installed applications, drives package install/remove through an external
//! packaging tool, keeps its in-memory registries in sync with storage, and
//! answers "which application handles this resource" through a routing table.
//!
//! ## Architecture
//!
//! All long-lived state is owned by a single [`engine::Engine`]:
//!
//! - Descriptor Model: records for applications, packages, services and launch
//!   points ([`descriptor`], [`store`])
//! - Reconciler: walks app storage and diffs it against the registered view
//!   without breaking record identity ([`reconciler`])
//! - Routing Table: mime type / URL pattern handler nodes with alternates and
//!   verb caches ([`routing`])
//! - Command Executor: a strictly serialized queue around the external
//!   packaging tool ([`executor`])
//! - Ticketed Status Relay: correlates a request with its later status
//!   events, including chained upstream requests ([`event::relay`])
//!
//! ## Request Flow
//!
//! ```text
//! install/remove ──▶ CommandExecutor ──▶ packaging tool
//!                          │                   │ status lines / exit code
//!                          ▼                   ▼
//!                     TicketRelay ◀──── protocol mapping
//!                          │
//!                          ▼ on success
//!                     Reconciler ──▶ DescriptorStore + RoutingTable ──▶ EventBus
//! ```
//!
//! Persisted state (dynamic launch points, hidden apps, package manifests and
//! the routing table) lives in [`storage`].

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod native_feature;
pub mod reconciler;
pub mod routing;
pub mod storage;
pub mod store;

// Re-exports
pub use engine::Engine;
pub use error::*;
pub use event::*;

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        // テストの前に一度だけ tracing を初期化する
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
