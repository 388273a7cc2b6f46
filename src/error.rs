use thiserror::Error;

use crate::config::ConfigError;
use crate::descriptor::DescriptorError;
use crate::event::event_bus::EventError;
use crate::event::relay::RelayError;
use crate::executor::ExecutorError;
use crate::native_feature::haptics::HapticsError;
use crate::reconciler::ReconcileError;
use crate::routing::RoutingError;
use crate::storage::StorageError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
    // relay / event
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Haptics error: {0}")]
    Haptics(#[from] HapticsError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
