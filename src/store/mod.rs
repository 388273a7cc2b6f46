//! # Descriptor Store
//!
//! The single owner of every descriptor record. Records are keyed by id and
//! never handed out by ownership: callers look them up by id and receive
//! borrowed views. Updates merge fields into the stored record, so an id keeps
//! pointing at the same logical record across updates; each merge bumps the
//! record's `generation` so observers can tell an updated record apart.
//!
//! App ids are unique across registered apps (system and user) and pending
//! fresh installs.

pub mod pending;

pub use pending::{InstallEvent, PendingInstall, PendingOutcome, PendingState};

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::descriptor::{Application, Package, Service};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("App already registered: {0}")]
    DuplicateApp(String),
    #[error("App not found: {0}")]
    AppNotFound(String),
    #[error("Package not found: {0}")]
    PackageNotFound(String),
    #[error("Launch point not found: {0}")]
    LaunchPointNotFound(String),
    #[error("Invalid pending transition for {app_id}: {event} in state {state}")]
    InvalidTransition {
        app_id: String,
        state: String,
        event: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Default)]
pub struct DescriptorStore {
    apps: BTreeMap<String, Application>,
    packages: BTreeMap<String, Package>,
    services: BTreeMap<String, Service>,
    pending: BTreeMap<String, PendingInstall>,
    hidden: BTreeSet<String>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_hidden(hidden: BTreeSet<String>) -> Self {
        Self {
            hidden,
            ..Default::default()
        }
    }

    // --- applications

    pub fn app(&self, id: &str) -> Option<&Application> {
        self.apps.get(id)
    }

    pub(crate) fn app_mut(&mut self, id: &str) -> Option<&mut Application> {
        self.apps.get_mut(id)
    }

    pub fn apps(&self) -> &BTreeMap<String, Application> {
        &self.apps
    }

    pub fn contains_app(&self, id: &str) -> bool {
        self.apps.contains_key(id)
    }

    pub fn insert_app(&mut self, app: Application) -> StoreResult<()> {
        if self.apps.contains_key(&app.id) {
            return Err(StoreError::DuplicateApp(app.id));
        }
        if self
            .pending
            .get(&app.id)
            .is_some_and(|p| p.placeholder.is_some())
        {
            // promotion of a fresh install replaces its placeholder
            self.pending.remove(&app.id);
        }
        self.apps.insert(app.id.clone(), app);
        Ok(())
    }

    pub fn remove_app(&mut self, id: &str) -> Option<Application> {
        self.apps.remove(id)
    }

    // --- packages / services

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.get(id)
    }

    pub(crate) fn package_mut(&mut self, id: &str) -> Option<&mut Package> {
        self.packages.get_mut(id)
    }

    pub fn packages(&self) -> &BTreeMap<String, Package> {
        &self.packages
    }

    pub fn package_for_app(&self, app_id: &str) -> Option<&Package> {
        self.apps
            .get(app_id)
            .and_then(|app| self.packages.get(&app.package_id))
            .or_else(|| self.packages.values().find(|p| p.contains_app(app_id)))
    }

    /// Package by its own id, falling back to the package containing the given app id
    pub fn resolve_package(&self, package_or_app_id: &str) -> Option<&Package> {
        self.packages
            .get(package_or_app_id)
            .or_else(|| self.package_for_app(package_or_app_id))
    }

    pub fn upsert_package(&mut self, package: Package) -> Option<Package> {
        self.packages.insert(package.id.clone(), package)
    }

    pub fn remove_package(&mut self, id: &str) -> Option<Package> {
        self.packages.remove(id)
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    pub fn upsert_service(&mut self, service: Service) -> Option<Service> {
        self.services.insert(service.id.clone(), service)
    }

    pub fn remove_service(&mut self, id: &str) -> Option<Service> {
        self.services.remove(id)
    }

    // --- pending installs

    pub fn pending(&self) -> &BTreeMap<String, PendingInstall> {
        &self.pending
    }

    pub fn pending_install(&self, app_id: &str) -> Option<&PendingInstall> {
        self.pending.get(app_id)
    }

    /// Apply a status report to the pending entry for `app_id`, creating it
    /// in `Unknown` if needed.
    pub fn apply_pending(
        &mut self,
        app_id: &str,
        event: &InstallEvent,
    ) -> StoreResult<(PendingOutcome, PendingInstall)> {
        let registered = self.apps.contains_key(app_id);
        let entry = self
            .pending
            .entry(app_id.to_string())
            .or_insert_with(|| PendingInstall::new(app_id));
        let outcome = match entry.apply(event, registered) {
            Ok(outcome) => outcome,
            Err(e) => {
                if entry.state == PendingState::Unknown {
                    self.pending.remove(app_id);
                }
                return Err(e);
            }
        };
        let snapshot = entry.clone();
        if matches!(outcome, PendingOutcome::Dropped | PendingOutcome::Reverted) {
            self.pending.remove(app_id);
        }
        Ok((outcome, snapshot))
    }

    pub fn drop_pending(&mut self, app_id: &str) -> Option<PendingInstall> {
        self.pending.remove(app_id)
    }

    // --- hidden apps

    pub fn hidden(&self) -> &BTreeSet<String> {
        &self.hidden
    }

    pub fn is_hidden(&self, app_id: &str) -> bool {
        self.hidden.contains(app_id)
    }

    pub fn set_hidden(&mut self, app_id: &str, hidden: bool) -> bool {
        if hidden {
            self.hidden.insert(app_id.to_string())
        } else {
            self.hidden.remove(app_id)
        }
    }
}
