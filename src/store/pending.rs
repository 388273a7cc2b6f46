//! Pending-install state machine.
//!
//! Driven by asynchronous install status reports, never by scanning:
//!
//! ```text
//! Unknown ──▶ Installing | Updating ──▶ Canceled  (revert update / drop install)
//!                                   ├──▶ Failed    (terminal until retried)
//!                                   └──▶ Completed (promote into registered view)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::{AppStatus, Application};

use super::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum PendingState {
    Unknown,
    Installing,
    Updating,
    Canceled,
    Failed,
    Completed,
}

/// An asynchronous status report for an app being installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum InstallEvent {
    Started { version: String },
    Progress { percent: u32 },
    Canceled,
    Failed,
    Completed,
}

/// What the caller has to do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Still in flight; publish progress
    Tracking,
    /// Canceled update; the registered record goes back to Ready
    Reverted,
    /// Canceled fresh install; the pending entry is gone
    Dropped,
    /// Failed; the pending entry stays to report the failure
    Failed,
    /// Completed; rescan the app and drop the pending entry
    Promote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInstall {
    pub app_id: String,
    pub version: String,
    pub state: PendingState,
    pub progress: u32,
    pub updated_at: DateTime<Utc>,
    /// Stand-in record for a fresh install, so launchers can show it while
    /// the app is not registered yet. None for updates.
    pub placeholder: Option<Application>,
}

impl PendingInstall {
    pub fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            version: String::new(),
            state: PendingState::Unknown,
            progress: 0,
            updated_at: Utc::now(),
            placeholder: None,
        }
    }

    /// Apply one status report. `registered` tells whether the app already
    /// exists in the registered view, which decides Installing vs Updating.
    pub fn apply(&mut self, event: &InstallEvent, registered: bool) -> StoreResult<PendingOutcome> {
        use PendingState::*;

        let outcome = match (self.state, event) {
            (Unknown | Failed, InstallEvent::Started { version }) => {
                self.version = version.clone();
                self.progress = 0;
                self.begin(registered);
                PendingOutcome::Tracking
            }
            (Unknown, InstallEvent::Progress { percent }) => {
                self.begin(registered);
                self.set_progress(*percent);
                PendingOutcome::Tracking
            }
            (Installing | Updating, InstallEvent::Started { version }) => {
                self.version = version.clone();
                PendingOutcome::Tracking
            }
            (Installing | Updating, InstallEvent::Progress { percent }) => {
                self.set_progress(*percent);
                PendingOutcome::Tracking
            }
            (Installing, InstallEvent::Canceled) => {
                self.state = Canceled;
                PendingOutcome::Dropped
            }
            (Updating, InstallEvent::Canceled) => {
                self.state = Canceled;
                PendingOutcome::Reverted
            }
            (Installing | Updating, InstallEvent::Failed) => {
                self.state = Failed;
                if let Some(placeholder) = self.placeholder.as_mut() {
                    placeholder.status = AppStatus::Failed;
                }
                PendingOutcome::Failed
            }
            (Installing | Updating, InstallEvent::Completed) => {
                self.state = Completed;
                self.set_progress(100);
                PendingOutcome::Promote
            }
            (state, event) => {
                return Err(StoreError::InvalidTransition {
                    app_id: self.app_id.clone(),
                    state: state.to_string(),
                    event: format!("{:?}", event),
                });
            }
        };
        self.updated_at = Utc::now();
        Ok(outcome)
    }

    fn begin(&mut self, registered: bool) {
        if registered {
            self.state = PendingState::Updating;
            self.placeholder = None;
        } else {
            self.state = PendingState::Installing;
            let mut placeholder = Application::new(&self.app_id, &self.app_id);
            if !self.version.is_empty() {
                placeholder.version = self.version.clone();
            }
            placeholder.status = AppStatus::Installing;
            self.placeholder = Some(placeholder);
        }
    }

    fn set_progress(&mut self, percent: u32) {
        self.progress = percent.min(100);
        if let Some(placeholder) = self.placeholder.as_mut() {
            placeholder.progress = self.progress;
        }
    }

    /// Status a registered record should show while this entry is in flight
    pub fn app_status(&self) -> AppStatus {
        match self.state {
            PendingState::Installing => AppStatus::Installing,
            PendingState::Updating => AppStatus::Updating,
            PendingState::Failed => AppStatus::Failed,
            _ => AppStatus::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> InstallEvent {
        InstallEvent::Started {
            version: "1.2.0".to_string(),
        }
    }

    #[test]
    fn test_fresh_install_completes() {
        let mut pending = PendingInstall::new("com.example.app");
        assert_eq!(pending.apply(&started(), false).unwrap(), PendingOutcome::Tracking);
        assert_eq!(pending.state, PendingState::Installing);
        assert!(pending.placeholder.is_some());

        pending
            .apply(&InstallEvent::Progress { percent: 250 }, false)
            .unwrap();
        assert_eq!(pending.progress, 100);

        assert_eq!(
            pending.apply(&InstallEvent::Completed, false).unwrap(),
            PendingOutcome::Promote
        );
        assert_eq!(pending.state, PendingState::Completed);
    }

    #[test]
    fn test_update_cancel_reverts() {
        let mut pending = PendingInstall::new("com.example.app");
        pending.apply(&started(), true).unwrap();
        assert_eq!(pending.state, PendingState::Updating);
        assert!(pending.placeholder.is_none());
        assert_eq!(
            pending.apply(&InstallEvent::Canceled, true).unwrap(),
            PendingOutcome::Reverted
        );
    }

    #[test]
    fn test_install_cancel_drops() {
        let mut pending = PendingInstall::new("com.example.app");
        pending.apply(&started(), false).unwrap();
        assert_eq!(
            pending.apply(&InstallEvent::Canceled, false).unwrap(),
            PendingOutcome::Dropped
        );
    }

    #[test]
    fn test_failed_is_terminal_until_restarted() {
        let mut pending = PendingInstall::new("com.example.app");
        pending.apply(&started(), false).unwrap();
        assert_eq!(
            pending.apply(&InstallEvent::Failed, false).unwrap(),
            PendingOutcome::Failed
        );
        assert_eq!(
            pending.placeholder.as_ref().unwrap().status,
            AppStatus::Failed
        );
        assert!(pending.apply(&InstallEvent::Completed, false).is_err());
        assert!(pending.apply(&InstallEvent::Canceled, false).is_err());
        // retry
        assert_eq!(pending.apply(&started(), false).unwrap(), PendingOutcome::Tracking);
        assert_eq!(pending.state, PendingState::Installing);
    }

    #[test]
    fn test_completed_before_start_is_rejected() {
        let mut pending = PendingInstall::new("com.example.app");
        let err = pending.apply(&InstallEvent::Completed, false).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
