//! # Reconciler
//!
//! Keeps the descriptor store and the routing table in sync with what is on
//! disk, without breaking record identity.
//!
//! ```text
//! scan_once ──▶ OnDiskView ──▶ diff::compute ──▶ apply
//!                                  │               ├─ changed: lock, terminate, merge in place
//!                   registered ────┘               ├─ removed: lock, terminate, drop launch points, delete
//!                                                  └─ added:   register, announce default launch point
//! ```
//!
//! Every change is announced on the [`EventBus`]. Reconciliation is not
//! reentrant: a second `scan` while one is running fails with
//! [`ReconcileError::InProgress`].
//!
//! Lock order is store before routing table.

pub mod diff;
pub mod scanner;

pub use diff::{ReconcileDiff, compute};
pub use scanner::{OnDiskView, ScanOutcome, SkippedEntry, scan_once, scan_target};

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ManagerConfig,
    descriptor::{AppStatus, Application, LaunchPoint},
    event::{ErrorEvent, ErrorSeverity, Event, EventBus, EventType, StatusChange, Value},
    executor::{RemoveMode, RemovePlan},
    routing::RoutingTable,
    storage::{
        LaunchPointStore, ManifestStore, PackageManifest, SizeCalculator, StorageError, fs_info,
        hidden,
    },
    store::{DescriptorStore, InstallEvent, PendingInstall, PendingOutcome, StoreError},
};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Reconciliation already in progress")]
    InProgress,
    #[error("App not found: {0}")]
    AppNotFound(String),
    #[error("Launch point not found: {0}")]
    LaunchPointNotFound(String),
    #[error("The default launch point {0} cannot be removed")]
    DefaultLaunchPoint(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Background scan failed: {0}")]
    Join(String),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub diff: ReconcileDiff,
    pub skipped: Vec<SkippedEntry>,
    pub packages_removed: Vec<String>,
    pub manifests_updated: Vec<String>,
}

pub struct Reconciler {
    config: Arc<ManagerConfig>,
    store: Arc<RwLock<DescriptorStore>>,
    routing: Arc<RwLock<RoutingTable>>,
    events: Arc<EventBus>,
    launch_points: LaunchPointStore,
    manifests: ManifestStore,
    sizes: SizeCalculator,
    installer_version: String,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ManagerConfig>,
        store: Arc<RwLock<DescriptorStore>>,
        routing: Arc<RwLock<RoutingTable>>,
        events: Arc<EventBus>,
        sizes: SizeCalculator,
    ) -> Self {
        Self {
            launch_points: LaunchPointStore::new(&config.launch_point_dir),
            manifests: ManifestStore::new(&config.manifest_dir),
            installer_version: config.executor.installer_version.clone(),
            config,
            store,
            routing,
            events,
            sizes,
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<RwLock<DescriptorStore>> {
        &self.store
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.events.publish(event) {
            warn!("failed to publish event: {}", e);
        }
    }

    fn publish_app(&self, app: &Application, change: StatusChange, cause: &str) {
        self.publish(Event::app_changed(&app.id, &app.version, change, cause));
    }

    fn publish_skipped(&self, skipped: &[SkippedEntry]) {
        for entry in skipped {
            let error = ErrorEvent::new("DescriptorSkipped", &entry.reason, ErrorSeverity::Warning)
                .with("path", Value::from(entry.path.display().to_string()))
                .with("validation", Value::from(entry.validation));
            if let Err(e) = self.events.publish_error(error) {
                warn!("failed to publish error event: {}", e);
            }
        }
    }

    fn publish_launch_point(&self, lp: &LaunchPoint, change: StatusChange) {
        self.publish(Event::launch_point_changed(&lp.id, &lp.app_id, change));
    }

    /// Full storage walk followed by reconciliation and manifest refresh.
    #[instrument(skip(self), level = "debug")]
    pub async fn scan(&self) -> ReconcileResult<ScanReport> {
        let _guard = self.running.try_lock().map_err(|_| ReconcileError::InProgress)?;
        let hidden = self.store.read().await.hidden().clone();
        let config = self.config.clone();
        let outcome = tokio::task::spawn_blocking(move || scan_once(&config, &hidden))
            .await
            .map_err(|e| ReconcileError::Join(e.to_string()))?;
        let report = self.apply(outcome, None).await?;
        self.publish(Event::new(EventType::ScanCompleted));
        info!(
            "scan complete: {} added, {} changed, {} removed, {} skipped",
            report.diff.added.len(),
            report.diff.changed.len(),
            report.diff.removed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Reconcile an on-disk view produced elsewhere.
    pub async fn reconcile(&self, view: OnDiskView) -> ReconcileResult<ReconcileDiff> {
        let _guard = self.running.try_lock().map_err(|_| ReconcileError::InProgress)?;
        let outcome = ScanOutcome {
            view,
            skipped: Vec::new(),
        };
        Ok(self.apply(outcome, None).await?.diff)
    }

    /// Rescan just the package or app `id` after an install. Falls back to a
    /// full scan when nothing is found under that id. Waits for a running
    /// scan instead of failing.
    #[instrument(skip(self), level = "debug")]
    pub async fn post_install_scan(&self, id: &str) -> ReconcileResult<ScanReport> {
        let guard = self.running.lock().await;
        let hidden = self.store.read().await.hidden().clone();
        let config = self.config.clone();
        let target = id.to_string();
        let outcome = tokio::task::spawn_blocking(move || scan_target(&config, &hidden, &target))
            .await
            .map_err(|e| ReconcileError::Join(e.to_string()))?;

        if outcome.view.apps.is_empty() {
            drop(guard);
            debug!("nothing found for {}, running a full scan", id);
            return self.scan().await;
        }

        let mut scope: BTreeSet<String> = outcome.view.apps.keys().cloned().collect();
        {
            let store = self.store.read().await;
            if let Some(package) = store.package(id) {
                scope.extend(package.app_ids.iter().cloned());
            }
            scope.extend(
                store
                    .apps()
                    .values()
                    .filter(|app| app.package_id == id)
                    .map(|app| app.id.clone()),
            );
        }
        self.apply(outcome, Some(scope)).await
    }

    async fn apply(
        &self,
        outcome: ScanOutcome,
        scope: Option<BTreeSet<String>>,
    ) -> ReconcileResult<ScanReport> {
        let ScanOutcome { view, skipped } = outcome;
        let dynamic = match self.launch_points.load_all().await {
            Ok(lps) => lps,
            Err(e) => {
                warn!("dynamic launch points unavailable: {}", e);
                Vec::new()
            }
        };

        self.publish_skipped(&skipped);
        let mut report = ScanReport {
            skipped,
            ..Default::default()
        };
        let mut refresh = Vec::new();
        let mut lp_cleanup = Vec::new();
        {
            let mut store = self.store.write().await;
            let mut routing = self.routing.write().await;
            let diff = compute(store.apps(), &view.apps, scope.as_ref());

            for id in &diff.changed {
                let Some(incoming) = view.apps.get(id) else {
                    continue;
                };
                self.apply_changed(&mut store, &mut routing, incoming);
            }
            for id in &diff.removed {
                self.remove_app_record(&mut store, &mut routing, id, "scan");
                lp_cleanup.push(id.clone());
            }
            for id in &diff.added {
                let Some(incoming) = view.apps.get(id) else {
                    continue;
                };
                let mut app = incoming.clone();
                for lp in dynamic.iter().filter(|lp| &lp.app_id == id) {
                    app.attach_launch_point(lp.clone());
                }
                if let Some(pending) = store.pending_install(id) {
                    app.status = pending.app_status();
                    app.progress = pending.progress;
                }
                routing.register_app(&app);
                let launch_points = app.launch_points.clone();
                store.insert_app(app)?;
                if let Some(app) = store.app(id) {
                    self.publish_app(app, StatusChange::Added, "scan");
                }
                for lp in &launch_points {
                    self.publish_launch_point(lp, StatusChange::Added);
                }
            }

            // packages and services
            let in_scope = |app_ids: &[String]| match &scope {
                None => true,
                Some(scope) => app_ids.iter().any(|id| scope.contains(id)),
            };
            for package in view.packages.values() {
                let previous = store.package(&package.id).cloned();
                let mut package = package.clone();
                match &previous {
                    Some(prev) if prev.same_install(&package) => {
                        package.installed_size = prev.installed_size;
                        package.block_size = prev.block_size;
                    }
                    Some(_) => {
                        refresh.push(package.id.clone());
                        self.publish(
                            Event::new(EventType::PackageChanged {
                                package_id: package.id.clone(),
                                change: StatusChange::Updated,
                            })
                            .with("version", Value::from(package.version.as_str())),
                        );
                    }
                    None => {
                        refresh.push(package.id.clone());
                        self.publish(
                            Event::new(EventType::PackageChanged {
                                package_id: package.id.clone(),
                                change: StatusChange::Added,
                            })
                            .with("version", Value::from(package.version.as_str())),
                        );
                    }
                }
                store.upsert_package(package);
            }
            let stale: Vec<String> = store
                .packages()
                .values()
                .filter(|p| !view.packages.contains_key(&p.id) && in_scope(p.app_ids.as_slice()))
                .filter(|p| scope.is_some() || !p.app_ids.iter().any(|id| view.apps.contains_key(id)))
                .map(|p| p.id.clone())
                .collect();
            for package_id in stale {
                store.remove_package(&package_id);
                self.publish(Event::new(EventType::PackageChanged {
                    package_id: package_id.clone(),
                    change: StatusChange::Removed,
                }));
                report.packages_removed.push(package_id);
            }
            for service in view.services.values() {
                store.upsert_service(service.clone());
            }
            if scope.is_none() {
                let gone: Vec<String> = store
                    .services()
                    .keys()
                    .filter(|id| !view.services.contains_key(*id))
                    .cloned()
                    .collect();
                for id in gone {
                    store.remove_service(&id);
                }
            }
            report.diff = diff;
        }

        for app_id in lp_cleanup {
            if let Err(e) = self.launch_points.delete_for_app(&app_id).await {
                warn!("failed to delete launch points of {}: {}", app_id, e);
            }
        }
        for package_id in &report.packages_removed {
            if let Err(e) = self.manifests.delete(package_id).await {
                warn!("failed to delete manifest of {}: {}", package_id, e);
            }
        }
        if scope.is_none() {
            // startup: pick up cached sizes for every writable package
            let store = self.store.read().await;
            refresh = store
                .packages()
                .values()
                .filter(|p| !p.read_only)
                .map(|p| p.id.clone())
                .collect();
        }
        report.manifests_updated = self.refresh_manifests(&refresh).await;
        Ok(report)
    }

    fn apply_changed(
        &self,
        store: &mut DescriptorStore,
        routing: &mut RoutingTable,
        incoming: &Application,
    ) {
        let Some(app) = store.app_mut(&incoming.id) else {
            return;
        };
        app.execution_locked = true;
        self.publish(Event::new(EventType::TerminateRequested {
            app_id: app.id.clone(),
        }));
        let outcome = app.merge_from(incoming);
        if outcome.registrations_changed {
            routing.remove_all_for_app_id(&app.id);
            routing.register_app(app);
        }
        if outcome.default_launch_point_changed {
            if let Some(lp) = app.default_launch_point() {
                self.publish_launch_point(lp, StatusChange::Updated);
            }
        }
        app.execution_locked = false;
        self.publish_app(app, StatusChange::Updated, "scan");
    }

    /// Lock, terminate, detach launch points, unroute and delete one app.
    /// Persisted launch point files are left to the caller.
    fn remove_app_record(
        &self,
        store: &mut DescriptorStore,
        routing: &mut RoutingTable,
        app_id: &str,
        cause: &str,
    ) -> Option<Application> {
        let app = store.app_mut(app_id)?;
        app.execution_locked = true;
        app.marked_for_removal = true;
        self.publish(Event::new(EventType::TerminateRequested {
            app_id: app_id.to_string(),
        }));
        let launch_points = std::mem::take(&mut app.launch_points);
        for lp in &launch_points {
            self.publish_launch_point(lp, StatusChange::Removed);
        }
        routing.remove_all_for_app_id(app_id);
        let removed = store.remove_app(app_id)?;
        self.publish_app(&removed, StatusChange::Removed, cause);
        Some(removed)
    }

    /// Recompute the size manifest of each package unless a valid one is
    /// cached, and copy the size into the package record. Returns the ids
    /// whose manifest was recomputed.
    async fn refresh_manifests(&self, package_ids: &[String]) -> Vec<String> {
        let mut updated = Vec::new();
        for package_id in package_ids {
            let (version, dirs) = {
                let store = self.store.read().await;
                let Some(package) = store.package(package_id).filter(|p| !p.read_only) else {
                    continue;
                };
                let mut dirs: Vec<_> = package
                    .app_ids
                    .iter()
                    .filter_map(|id| store.app(id))
                    .map(|app| app.folder_path.clone())
                    .collect();
                dirs.extend(
                    package
                        .service_ids
                        .iter()
                        .filter_map(|id| store.service(id))
                        .map(|s| s.folder_path.clone()),
                );
                dirs.extend(package.folder_path.clone());
                (package.version.clone(), dirs)
            };
            let Some(first) = dirs.first() else {
                continue;
            };
            let block_size = match fs_info::query(first) {
                Ok(space) => space.block_size,
                Err(e) => {
                    warn!("cannot stat {}: {}", first.display(), e);
                    continue;
                }
            };

            let cached = match self.manifests.load(package_id).await {
                Ok(cached) => cached,
                Err(e) => {
                    warn!("unreadable manifest for {}: {}", package_id, e);
                    None
                }
            };
            let manifest = match cached {
                Some(m) if m.is_valid_for(&version, &self.installer_version, block_size) => m,
                _ => {
                    let size = match self.sizes.measure(dirs, block_size).await {
                        Ok(size) => size,
                        Err(e) => {
                            warn!("size computation for {} failed: {}", package_id, e);
                            continue;
                        }
                    };
                    let manifest =
                        PackageManifest::new(package_id, &version, &self.installer_version, size);
                    if let Err(e) = self.manifests.save(&manifest).await {
                        warn!("failed to save manifest for {}: {}", package_id, e);
                    }
                    self.publish(Event::new(EventType::ManifestUpdated {
                        package_id: package_id.clone(),
                    }));
                    updated.push(package_id.clone());
                    manifest
                }
            };

            let mut store = self.store.write().await;
            if let Some(package) = store.package_mut(package_id) {
                package.installed_size = manifest.rounded_bytes;
                package.block_size = manifest.block_size;
            }
        }
        updated
    }

    /// Drive the pending-install state machine with one status report.
    #[instrument(skip(self), level = "debug")]
    pub async fn report_install_status(
        &self,
        app_id: &str,
        event: InstallEvent,
    ) -> ReconcileResult<PendingInstall> {
        let (outcome, pending) = {
            let mut store = self.store.write().await;
            let (outcome, pending) = store.apply_pending(app_id, &event)?;
            let version = pending.version.clone();
            match outcome {
                PendingOutcome::Tracking | PendingOutcome::Failed => {
                    let status = pending.app_status();
                    let change = match outcome {
                        PendingOutcome::Failed => StatusChange::Updated,
                        _ => StatusChange::Progress,
                    };
                    if let Some(app) = store.app_mut(app_id) {
                        app.status = status;
                        app.progress = pending.progress;
                    }
                    self.publish(
                        Event::app_changed(app_id, &version, change, "install")
                            .with("status", Value::from(status.to_string()))
                            .with("progress", Value::Integer(i64::from(pending.progress))),
                    );
                }
                PendingOutcome::Reverted => {
                    if let Some(app) = store.app_mut(app_id) {
                        app.status = AppStatus::Ready;
                        app.progress = 0;
                    }
                    self.publish(Event::app_changed(
                        app_id,
                        &version,
                        StatusChange::Updated,
                        "canceled",
                    ));
                }
                PendingOutcome::Dropped => {
                    self.publish(Event::app_changed(
                        app_id,
                        &version,
                        StatusChange::Removed,
                        "canceled",
                    ));
                }
                PendingOutcome::Promote => {}
            }
            (outcome, pending)
        };

        if outcome == PendingOutcome::Promote {
            self.post_install_scan(app_id).await?;
            let mut store = self.store.write().await;
            store.drop_pending(app_id);
            if let Some(app) = store.app_mut(app_id) {
                app.status = AppStatus::Ready;
                app.progress = 0;
            }
        }
        Ok(pending)
    }

    /// Bookkeeping after a package left storage: records, launch points,
    /// routes and the manifest. A shallow remove also hides the apps so the
    /// next scan does not bring them back.
    #[instrument(skip(self, plan), fields(package_id = %plan.package_id), level = "debug")]
    pub async fn remove_package_records(&self, plan: &RemovePlan, cause: &str) -> ReconcileResult<()> {
        let hidden_now = {
            let mut store = self.store.write().await;
            let mut routing = self.routing.write().await;
            for app_id in &plan.app_ids {
                self.remove_app_record(&mut store, &mut routing, app_id, cause);
            }
            for service_id in &plan.service_ids {
                store.remove_service(service_id);
            }
            if store.remove_package(&plan.package_id).is_some() {
                self.publish(Event::new(EventType::PackageChanged {
                    package_id: plan.package_id.clone(),
                    change: StatusChange::Removed,
                }));
            }
            if plan.mode == RemoveMode::Shallow {
                for app_id in &plan.app_ids {
                    store.set_hidden(app_id, true);
                }
                Some(store.hidden().clone())
            } else {
                None
            }
        };

        for app_id in &plan.app_ids {
            self.launch_points.delete_for_app(app_id).await?;
        }
        self.manifests.delete(&plan.package_id).await?;
        if let Some(hidden_set) = hidden_now {
            hidden::save(&self.config.hidden_apps_path, &hidden_set).await?;
        }
        Ok(())
    }

    async fn set_visibility(&self, app_id: &str, visible: bool) -> ReconcileResult<bool> {
        let hidden_set = {
            let mut store = self.store.write().await;
            let changed = store.set_hidden(app_id, !visible);
            let Some(app) = store.app_mut(app_id) else {
                // keep the list untouched for unknown ids
                store.set_hidden(app_id, visible);
                return Err(ReconcileError::AppNotFound(app_id.to_string()));
            };
            if !changed && app.visible == visible {
                return Ok(false);
            }
            app.visible = visible;
            app.generation += 1;
            let cause = if visible { "unhidden" } else { "hidden" };
            self.publish_app(app, StatusChange::Updated, cause);
            store.hidden().clone()
        };
        hidden::save(&self.config.hidden_apps_path, &hidden_set).await?;
        Ok(true)
    }

    pub async fn hide_app(&self, app_id: &str) -> ReconcileResult<bool> {
        self.set_visibility(app_id, false).await
    }

    pub async fn unhide_app(&self, app_id: &str) -> ReconcileResult<bool> {
        self.set_visibility(app_id, true).await
    }

    pub async fn add_launch_point(
        &self,
        app_id: &str,
        title: Option<&str>,
        icon: Option<&str>,
        params: serde_json::Value,
    ) -> ReconcileResult<LaunchPoint> {
        let (default_title, default_icon) = {
            let store = self.store.read().await;
            let app = store
                .app(app_id)
                .ok_or_else(|| ReconcileError::AppNotFound(app_id.to_string()))?;
            (app.title.clone(), app.icon.clone())
        };
        let id = self.launch_points.next_id(app_id).await;
        let lp = LaunchPoint::dynamic(
            id,
            app_id,
            title.unwrap_or(&default_title),
            icon.unwrap_or(&default_icon),
            params,
        );
        self.launch_points.save(&lp).await?;

        let mut store = self.store.write().await;
        let app = store
            .app_mut(app_id)
            .ok_or_else(|| ReconcileError::AppNotFound(app_id.to_string()))?;
        app.attach_launch_point(lp.clone());
        self.publish_launch_point(&lp, StatusChange::Added);
        Ok(lp)
    }

    pub async fn remove_launch_point(&self, launch_point_id: &str) -> ReconcileResult<LaunchPoint> {
        let removed = {
            let mut store = self.store.write().await;
            let owner = store
                .apps()
                .values()
                .find(|app| app.launch_point(launch_point_id).is_some())
                .map(|app| app.id.clone())
                .ok_or_else(|| ReconcileError::LaunchPointNotFound(launch_point_id.to_string()))?;
            let app = store
                .app_mut(&owner)
                .ok_or_else(|| ReconcileError::AppNotFound(owner.clone()))?;
            app.detach_launch_point(launch_point_id)
                .ok_or_else(|| ReconcileError::DefaultLaunchPoint(launch_point_id.to_string()))?
        };
        self.launch_points.delete(launch_point_id).await?;
        self.publish_launch_point(&removed, StatusChange::Removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ResourceRegistration;
    use serde_json::json;
    use std::{collections::BTreeMap, path::PathBuf};

    fn reconciler(base: &std::path::Path) -> Reconciler {
        let config = Arc::new(ManagerConfig::rooted_at(base));
        Reconciler::new(
            config,
            Arc::new(RwLock::new(DescriptorStore::new())),
            Arc::new(RwLock::new(RoutingTable::new(Some(1)))),
            Arc::new(EventBus::new(256)),
            SizeCalculator::new(),
        )
    }

    fn app(id: &str) -> Application {
        let mut app = Application::new(id, id);
        app.folder_path = PathBuf::from(format!("/nowhere/{}", id));
        app
    }

    fn view(apps: &[Application]) -> OnDiskView {
        OnDiskView {
            apps: apps.iter().map(|a| (a.id.clone(), a.clone())).collect(),
            packages: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        let on_disk = view(&[app("a"), app("b")]);

        let first = reconciler.reconcile(on_disk.clone()).await.unwrap();
        assert_eq!(first.added, vec!["a", "b"]);
        assert!(reconciler.reconcile(on_disk.clone()).await.unwrap().is_empty());
        assert!(reconciler.reconcile(on_disk).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_record_keeps_identity() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        let (mut rx, _) = reconciler.events.subscribe();
        reconciler.reconcile(view(&[app("a")])).await.unwrap();

        let mut updated = app("a");
        updated.title = "Renamed".to_string();
        updated.category = "tools".to_string();
        updated.resource_registrations.push(ResourceRegistration {
            mime: "text/plain".to_string(),
            extension: None,
            should_download_first: false,
            verbs: BTreeMap::new(),
        });
        let diff = reconciler.reconcile(view(&[updated])).await.unwrap();
        assert_eq!(diff.changed, vec!["a"]);

        let store = reconciler.store.read().await;
        let record = store.app("a").unwrap();
        assert_eq!(record.generation, 1);
        assert!(!record.execution_locked);
        assert_eq!(record.default_launch_point().unwrap().title, "Renamed");
        assert_eq!(
            reconciler.routing.read().await.resolve("text/plain").unwrap().app_id,
            "a"
        );

        let events: Vec<_> = rx.drain().into_iter().map(|e| e.event_type).collect();
        assert!(events.contains(&EventType::TerminateRequested {
            app_id: "a".to_string()
        }));
        assert!(events.contains(&EventType::LaunchPointChanged {
            launch_point_id: "a_default".to_string(),
            app_id: "a".to_string(),
            change: StatusChange::Updated
        }));
    }

    #[tokio::test]
    async fn test_removed_app_loses_launch_points_and_routes() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        let mut a = app("a");
        a.resource_registrations.push(ResourceRegistration {
            mime: "audio/mpa".to_string(),
            extension: None,
            should_download_first: false,
            verbs: BTreeMap::new(),
        });
        reconciler.reconcile(view(&[a])).await.unwrap();
        let lp = reconciler
            .add_launch_point("a", Some("Shortcut"), None, json!({"x": 1}))
            .await
            .unwrap();
        let (mut rx, _) = reconciler.events.subscribe();

        let diff = reconciler.reconcile(view(&[])).await.unwrap();
        assert_eq!(diff.removed, vec!["a"]);
        assert!(reconciler.routing.read().await.resolve("audio/mpa").is_none());
        assert!(reconciler.launch_points.load_all().await.unwrap().is_empty());

        let removed_lps: Vec<_> = rx
            .drain()
            .into_iter()
            .filter_map(|e| match e.event_type {
                EventType::LaunchPointChanged {
                    launch_point_id,
                    change: StatusChange::Removed,
                    ..
                } => Some(launch_point_id),
                _ => None,
            })
            .collect();
        assert_eq!(removed_lps, vec!["a_default".to_string(), lp.id]);
    }

    #[tokio::test]
    async fn test_scan_is_not_reentrant() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        let _held = reconciler.running.lock().await;
        assert!(matches!(
            reconciler.scan().await,
            Err(ReconcileError::InProgress)
        ));
    }

    #[tokio::test]
    async fn test_launch_point_management() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        reconciler.reconcile(view(&[app("a")])).await.unwrap();

        let lp = reconciler
            .add_launch_point("a", None, Some("star.png"), json!({}))
            .await
            .unwrap();
        assert_eq!(lp.title, "a");
        assert!(matches!(
            reconciler.remove_launch_point("a_default").await,
            Err(ReconcileError::DefaultLaunchPoint(_))
        ));
        assert!(matches!(
            reconciler.add_launch_point("zz", None, None, json!({})).await,
            Err(ReconcileError::AppNotFound(_))
        ));
        reconciler.remove_launch_point(&lp.id).await.unwrap();
        assert_eq!(
            reconciler.store.read().await.app("a").unwrap().launch_points.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_hide_and_unhide_persist_list() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        reconciler.reconcile(view(&[app("a")])).await.unwrap();

        assert!(reconciler.hide_app("a").await.unwrap());
        assert!(!reconciler.hide_app("a").await.unwrap());
        assert!(!reconciler.store.read().await.app("a").unwrap().visible);
        let listed = hidden::load(&reconciler.config.hidden_apps_path).await.unwrap();
        assert!(listed.contains("a"));

        assert!(reconciler.unhide_app("a").await.unwrap());
        assert!(hidden::load(&reconciler.config.hidden_apps_path).await.unwrap().is_empty());
        assert!(reconciler.hide_app("missing").await.is_err());
        assert!(!reconciler.store.read().await.is_hidden("missing"));
    }

    #[tokio::test]
    async fn test_pending_update_progress_and_cancel() {
        let base = tempfile::tempdir().unwrap();
        let reconciler = reconciler(base.path());
        reconciler.reconcile(view(&[app("a")])).await.unwrap();

        reconciler
            .report_install_status("a", InstallEvent::Started { version: "2.0".into() })
            .await
            .unwrap();
        reconciler
            .report_install_status("a", InstallEvent::Progress { percent: 40 })
            .await
            .unwrap();
        {
            let store = reconciler.store.read().await;
            let record = store.app("a").unwrap();
            assert_eq!(record.status, AppStatus::Updating);
            assert_eq!(record.progress, 40);
        }
        reconciler
            .report_install_status("a", InstallEvent::Canceled)
            .await
            .unwrap();
        let store = reconciler.store.read().await;
        assert_eq!(store.app("a").unwrap().status, AppStatus::Ready);
        assert!(store.pending_install("a").is_none());
    }
}
