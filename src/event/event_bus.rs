//! # Event Bus Implementation
//!
//! Broadcast-based publish-subscribe for registry change notifications. The
//! reconciler publishes an event for every application or launch point that
//! is added, updated or removed; collaborators (launcher UI, instance
//! manager) subscribe and react.
//!
//! ## Design Decisions
//!
//! The implementation uses Tokio's broadcast channel rather than MPSC channels to:
//!
//! 1. Allow multiple subscribers to receive the same event
//! 2. Never block the publisher: a slow subscriber lags and resubscribes
//! 3. Support publishing from synchronous code while a store lock is held
//!
//! An internal receiver keeps the channel open, so publishing with no
//! external subscribers succeeds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StatusChange {
    Added,
    Updated,
    Removed,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, Default)]
pub enum EventType {
    AppChanged {
        app_id: String,
        change: StatusChange,
    },
    LaunchPointChanged {
        launch_point_id: String,
        app_id: String,
        change: StatusChange,
    },
    PackageChanged {
        package_id: String,
        change: StatusChange,
    },
    /// Running instances of the app must be closed before its record changes
    TerminateRequested {
        app_id: String,
    },
    ManifestUpdated {
        package_id: String,
    },
    #[default]
    ScanCompleted,
    BrickModeChanged {
        active: bool,
    },
}

/// A discrete registry change notification.
///
/// `parameters` carries the loosely typed extras (`version`, `cause`,
/// `progress`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub parameters: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            event_type: EventType::default(),
            parameters: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ..Default::default()
        }
    }

    pub fn app_changed(app_id: &str, version: &str, change: StatusChange, cause: &str) -> Self {
        Self::new(EventType::AppChanged {
            app_id: app_id.to_string(),
            change,
        })
        .with("version", Value::from(version))
        .with("cause", Value::from(cause))
    }

    pub fn launch_point_changed(launch_point_id: &str, app_id: &str, change: StatusChange) -> Self {
        Self::new(EventType::LaunchPointChanged {
            launch_point_id: launch_point_id.to_string(),
            app_id: app_id.to_string(),
            change,
        })
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn app_id(&self) -> Option<&str> {
        match &self.event_type {
            EventType::AppChanged { app_id, .. }
            | EventType::LaunchPointChanged { app_id, .. }
            | EventType::TerminateRequested { app_id } => Some(app_id),
            _ => None,
        }
    }
}

/// Something went wrong without stopping the engine: a descriptor that was
/// skipped, a command that ended in failure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub parameters: HashMap<String, Value>,
}

impl ErrorEvent {
    pub fn new(error_type: &str, message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            error_type: error_type.to_string(),
            message: message.into(),
            severity,
            parameters: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorSeverity {
    #[default]
    Warning, // 通知のみ
    Error, // 処理中断
}

// 値の型
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// # EventBus
///
/// Central hub for registry change notifications. It maintains two separate
/// channels:
/// 1. A regular event channel for registry changes
/// 2. An error event channel for skipped descriptors and tool failures
pub struct EventBus {
    event_sender: broadcast::Sender<Event>,
    error_sender: broadcast::Sender<ErrorEvent>,
    capacity: usize,
    _internal_receiver: broadcast::Receiver<Event>,
    _internal_error_receiver: broadcast::Receiver<ErrorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_sender, event_receiver) = broadcast::channel(capacity);
        let (error_sender, error_receiver) = broadcast::channel(capacity);
        Self {
            event_sender,
            error_sender,
            capacity,
            _internal_receiver: event_receiver,
            _internal_error_receiver: error_receiver,
        }
    }

    /// Subscribes to both regular and error events.
    pub fn subscribe(&self) -> (EventReceiver, ErrorReceiver) {
        let event_rx = self.event_sender.subscribe();
        let error_rx = self.error_sender.subscribe();
        (EventReceiver::new(event_rx), ErrorReceiver::new(error_rx))
    }

    /// Publishes an event to all subscribers. Never awaits, so it is safe to
    /// call while holding the store lock.
    pub fn publish(&self, event: Event) -> EventResult<()> {
        debug_event("Publishing", &event);
        self.event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn publish_error(&self, error: ErrorEvent) -> EventResult<()> {
        self.error_sender
            .send(error)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn subscribers_size(&self) -> usize {
        self.event_sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    match event.event_type {
        EventType::AppChanged {
            change: StatusChange::Progress,
            ..
        } => trace!("{} Event: {:?}", prefix, event),
        _ => debug!("{} Event: {:?}", prefix, event),
    }
}

pub struct EventReceiver {
    pub receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// イベントを受信する。Laggedエラーが発生した場合はresubscribeを試みて、エラーを返す。
    pub async fn recv(&mut self) -> EventResult<Event> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Drain whatever is already buffered without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

pub struct ErrorReceiver {
    pub receiver: broadcast::Receiver<ErrorEvent>,
}

impl ErrorReceiver {
    fn new(receiver: broadcast::Receiver<ErrorEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> EventResult<ErrorEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| EventError::ReceiveFailed {
                message: e.to_string(),
            })
    }

    pub fn drain(&mut self) -> Vec<ErrorEvent> {
        let mut errors = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(error) => errors.push(error),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        errors
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event Send failed: {message}")]
    SendFailed { message: String },

    #[error("Event Receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("Event lagged: {count}")]
    Lagged { count: u64 },
}

pub type EventResult<T> = Result<T, EventError>;
