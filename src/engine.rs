//! # Engine
//!
//! Owns every long-lived component and is the only entry point callers
//! need. There is no global state: two engines over two configs are fully
//! independent.
//!
//! ```text
//!            ┌────────────────────── Engine ──────────────────────┐
//! request ──▶│ CommandExecutor ──▶ Reconciler ──▶ DescriptorStore │
//!            │       │                  │            RoutingTable │
//!            │       ▼                  ▼                         │
//!            │  TicketRelay          EventBus                     │
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! Ticketed operations (`install`, `remove`) subscribe the caller before the
//! command is queued, so the returned receiver sees every status from
//! `Queued` through the terminal one.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ManagerConfig,
    descriptor::{Application, LaunchPoint, Package},
    error::InternalResult,
    event::{
        EventBus, Ticket, TicketRelay,
        event_bus::{ErrorReceiver, EventReceiver},
        relay::TicketReceiver,
    },
    executor::{
        CapacityReport, CapacityRequest, CommandExecutor, ExecutorContext, ExecutorSnapshot,
        InstallRequest, SpaceAvailability, query_install_capacity,
    },
    native_feature::{Vibrator, detect},
    reconciler::{Reconciler, ScanReport},
    routing::{Handler, HandlerRegistration, HandlerSummary, Resolution, RoutingTable},
    storage::{SizeCalculator, fs_info, hidden},
    store::{DescriptorStore, InstallEvent, PendingInstall},
};

pub struct Engine {
    config: Arc<ManagerConfig>,
    store: Arc<RwLock<DescriptorStore>>,
    routing: Arc<RwLock<RoutingTable>>,
    events: Arc<EventBus>,
    relay: Arc<TicketRelay>,
    reconciler: Arc<Reconciler>,
    executor: CommandExecutor,
    vibrator: Arc<dyn Vibrator>,
    /// Handlers restored from disk are pruned against the first scan
    first_scan_done: AtomicBool,
}

impl Engine {
    /// Build the engine and start the executor. Restores the hidden-apps
    /// list and the persisted routing table; does not scan.
    #[instrument(skip(config), level = "debug")]
    pub async fn new(config: ManagerConfig) -> InternalResult<Self> {
        let config = Arc::new(config);
        let storage_root = config.install_root()?.path.clone();

        let hidden_apps = hidden::load(&config.hidden_apps_path).await?;
        let store = Arc::new(RwLock::new(DescriptorStore::with_hidden(hidden_apps)));

        let mut table = RoutingTable::new(config.routing_seed);
        if config.routing_table_path.exists() {
            match table.restore(&config.routing_table_path) {
                Ok(()) => debug!("routing table restored, {} nodes", table.node_count()),
                Err(e) => warn!("ignoring unreadable routing table: {}", e),
            }
        }
        let routing = Arc::new(RwLock::new(table));

        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let relay = Arc::new(TicketRelay::new());
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            store.clone(),
            routing.clone(),
            events.clone(),
            SizeCalculator::new(),
        ));
        let executor = CommandExecutor::spawn(ExecutorContext {
            config: config.executor.clone(),
            storage_root,
            relay: relay.clone(),
            events: events.clone(),
            reconciler: reconciler.clone(),
        });
        let vibrator = detect(&config.haptics);

        info!("engine ready ({} roots)", config.roots.len());
        Ok(Self {
            config,
            store,
            routing,
            events,
            relay,
            reconciler,
            executor,
            vibrator,
            first_scan_done: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RwLock<DescriptorStore>> {
        &self.store
    }

    pub fn routing(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn subscribe_events(&self) -> (EventReceiver, ErrorReceiver) {
        self.events.subscribe()
    }

    pub fn vibrator(&self) -> Arc<dyn Vibrator> {
        self.vibrator.clone()
    }

    // --- reconciliation

    pub async fn scan(&self) -> InternalResult<ScanReport> {
        let report = self.reconciler.scan().await?;
        if !self.first_scan_done.swap(true, Ordering::SeqCst) {
            self.prune_routing().await;
        }
        Ok(report)
    }

    pub async fn post_install_scan(&self, id: &str) -> InternalResult<ScanReport> {
        Ok(self.reconciler.post_install_scan(id).await?)
    }

    /// Drop restored handlers whose app did not come back.
    async fn prune_routing(&self) {
        let store = self.store.read().await;
        let mut routing = self.routing.write().await;
        for app_id in routing.app_ids() {
            if !store.contains_app(&app_id) {
                let freed = routing.remove_all_for_app_id(&app_id);
                debug!("pruned {} stale handlers of {}", freed.len(), app_id);
            }
        }
    }

    pub async fn report_install_status(
        &self,
        app_id: &str,
        event: InstallEvent,
    ) -> InternalResult<PendingInstall> {
        Ok(self.reconciler.report_install_status(app_id, event).await?)
    }

    // --- descriptor queries

    pub async fn app(&self, app_id: &str) -> Option<Application> {
        self.store.read().await.app(app_id).cloned()
    }

    pub async fn apps(&self) -> Vec<Application> {
        self.store.read().await.apps().values().cloned().collect()
    }

    pub async fn package(&self, package_or_app_id: &str) -> Option<Package> {
        self.store
            .read()
            .await
            .resolve_package(package_or_app_id)
            .cloned()
    }

    // --- tickets

    pub fn new_ticket(&self) -> Ticket {
        self.relay.new_ticket()
    }

    pub fn subscribe_ticket(&self, ticket: Ticket) -> InternalResult<TicketReceiver> {
        Ok(self.relay.subscribe(ticket)?)
    }

    /// Forward every status of `downstream` to subscribers of `upstream`.
    pub fn chain_tickets(&self, downstream: Ticket, upstream: Ticket) -> InternalResult<()> {
        Ok(self.relay.chain(downstream, upstream)?)
    }

    // --- executor

    /// Queue an install and return a receiver subscribed to its ticket.
    pub async fn install(&self, request: InstallRequest) -> InternalResult<TicketReceiver> {
        let ticket = self.relay.new_ticket();
        let receiver = self.relay.subscribe(ticket)?;
        self.install_with_ticket(request, ticket).await?;
        Ok(receiver)
    }

    /// Queue an install under a ticket the caller already holds.
    pub async fn install_with_ticket(
        &self,
        request: InstallRequest,
        ticket: Ticket,
    ) -> InternalResult<()> {
        if let Err(e) = self.executor.install(request, ticket).await {
            self.relay.release(ticket);
            return Err(e.into());
        }
        Ok(())
    }

    /// Queue removal of a package, named by its id or any of its app ids.
    pub async fn remove(&self, package_or_app_id: &str, cause: &str) -> InternalResult<TicketReceiver> {
        let ticket = self.relay.new_ticket();
        let receiver = self.relay.subscribe(ticket)?;
        self.remove_with_ticket(package_or_app_id, cause, ticket)
            .await?;
        Ok(receiver)
    }

    /// The target is resolved when the command runs; an unknown id or a
    /// refused removal ends the ticket with a failure status.
    pub async fn remove_with_ticket(
        &self,
        package_or_app_id: &str,
        cause: &str,
        ticket: Ticket,
    ) -> InternalResult<()> {
        if let Err(e) = self.executor.remove(package_or_app_id, ticket, cause).await {
            self.relay.release(ticket);
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether a package of `size_kb` (compressed) and
    /// `uncompressed_size_kb` fits. An installed version of `package_id`
    /// counts as space that will be freed.
    pub async fn query_install_capacity(
        &self,
        package_id: Option<&str>,
        size_kb: u64,
        uncompressed_size_kb: u64,
    ) -> InternalResult<CapacityReport> {
        let installed_kb = match package_id {
            Some(id) => self
                .store
                .read()
                .await
                .package(id)
                .map(|p| p.installed_size.div_ceil(1024))
                .unwrap_or(0),
            None => 0,
        };
        let download = fs_info::query(&self.config.download_dir)?;
        let install = fs_info::query(&self.config.install_root()?.path)?;
        Ok(query_install_capacity(
            CapacityRequest {
                size_kb,
                uncompressed_size_kb,
                installed_kb,
            },
            SpaceAvailability::from_filesystems(&download, &install),
        ))
    }

    /// Storage went away: kill the running tool and refuse new commands.
    /// Returns the interrupted ticket, if any.
    pub async fn enter_brick_mode(&self) -> InternalResult<Option<Ticket>> {
        Ok(self.executor.enter_brick_mode().await?)
    }

    pub async fn exit_brick_mode(&self) -> InternalResult<()> {
        Ok(self.executor.exit_brick_mode().await?)
    }

    pub async fn executor_snapshot(&self) -> InternalResult<ExecutorSnapshot> {
        Ok(self.executor.snapshot().await?)
    }

    // --- routing

    pub async fn resolve_resource(&self, mime_or_extension: &str) -> Option<Resolution> {
        self.routing.read().await.resolve_resource(mime_or_extension)
    }

    pub async fn resolve_redirect(&self, url: &str) -> Option<Resolution> {
        self.routing.read().await.resolve_redirect(url)
    }

    pub async fn resolve_for_url(&self, url: &str) -> Option<Resolution> {
        self.routing.read().await.resolve_for_url(url)
    }

    pub async fn resolve_by_verb(&self, key: &str, verb: &str) -> Option<Handler> {
        self.routing.write().await.resolve_by_verb(key, verb)
    }

    pub async fn add_handler(&self, registration: HandlerRegistration) -> InternalResult<u32> {
        Ok(self.routing.write().await.add_handler(registration)?)
    }

    pub async fn remove_handlers_for_app_id(&self, app_id: &str) -> Vec<u32> {
        self.routing.write().await.remove_all_for_app_id(app_id)
    }

    pub async fn swap_handler(&self, key: &str, index: u32) -> InternalResult<()> {
        Ok(self.routing.write().await.swap(key, index)?)
    }

    pub async fn register_verbs(
        &self,
        key: &str,
        app_id: &str,
        verbs: BTreeMap<String, String>,
    ) -> InternalResult<()> {
        Ok(self.routing.write().await.register_verbs(key, app_id, verbs)?)
    }

    pub async fn restore_default_handler(&self, key: &str) -> InternalResult<Option<u32>> {
        Ok(self.routing.write().await.restore_default_handler(key)?)
    }

    pub async fn list_handlers(&self, app_id: &str) -> Vec<HandlerSummary> {
        self.routing.read().await.list_handlers(app_id)
    }

    pub async fn save_routing(&self) -> InternalResult<PathBuf> {
        let path = self.config.routing_table_path.clone();
        self.routing.read().await.save(&path)?;
        Ok(path)
    }

    // --- visibility and launch points

    pub async fn hide_app(&self, app_id: &str) -> InternalResult<bool> {
        Ok(self.reconciler.hide_app(app_id).await?)
    }

    pub async fn unhide_app(&self, app_id: &str) -> InternalResult<bool> {
        Ok(self.reconciler.unhide_app(app_id).await?)
    }

    pub async fn add_launch_point(
        &self,
        app_id: &str,
        title: Option<&str>,
        icon: Option<&str>,
        params: serde_json::Value,
    ) -> InternalResult<LaunchPoint> {
        Ok(self
            .reconciler
            .add_launch_point(app_id, title, icon, params)
            .await?)
    }

    pub async fn remove_launch_point(&self, launch_point_id: &str) -> InternalResult<LaunchPoint> {
        Ok(self.reconciler.remove_launch_point(launch_point_id).await?)
    }

    pub async fn launch_points(&self, app_id: &str) -> Vec<LaunchPoint> {
        self.store
            .read()
            .await
            .app(app_id)
            .map(|app| app.launch_points.clone())
            .unwrap_or_default()
    }

    /// Stop the executor and persist the routing table.
    pub async fn shutdown(&self) -> InternalResult<()> {
        self.executor.shutdown().await?;
        if let Err(e) = self.vibrator.cancel_all().await {
            warn!("vibrator cancel failed: {}", e);
        }
        self.save_routing().await?;
        info!("engine stopped");
        Ok(())
    }
}
