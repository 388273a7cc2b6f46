//! # Command Executor
//!
//! Serializes install and remove requests against the external packaging
//! tool. Commands run strictly one at a time in FIFO order:
//!
//! ```text
//! enqueue ──▶ [queue] ──▶ try_start_next ──▶ tool process ──▶ Finished
//!                ▲                                              │
//!                └──────────── one_command_processed ◀──────────┘
//! ```
//!
//! The queue is owned by a single actor task; callers talk to it through
//! [`CommandExecutor`], a cheap cloneable handle. Each running command gets
//! its own task that spawns the tool, relays every protocol line under the
//! command's ticket, and reports back with a `Finished` message. Only that
//! message pops the queue head and lets the next command start.
//!
//! ## Brick mode
//!
//! While the storage partition is unavailable the executor is in brick
//! mode. Entering it kills the running tool at once and leaves its command
//! at the queue head as `Interrupted`; no terminal status is relayed for it,
//! since its outcome is unknown. New commands are refused. Leaving brick
//! mode checks the storage path, drops interrupted heads and resumes the
//! queue in order.

pub mod capacity;
pub mod command;
pub mod protocol;
pub mod remove;

pub use capacity::{
    CapacityReport, CapacityRequest, CapacityShortfall, SpaceAvailability, query_install_capacity,
};
pub use command::{Command, CommandKind, CommandRecord, CommandState, InstallRequest};
pub use protocol::{ExitInfo, FailureCode, InstallPhase, OperationStatus};
pub use remove::{RemoveMode, RemovePlan, plan_removal};

use std::{collections::VecDeque, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command as ToolCommand,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::{StreamExt, wrappers::LinesStream};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::ExecutorConfig,
    event::{ErrorEvent, ErrorSeverity, Event, EventBus, EventType, Ticket, TicketRelay, Value},
    reconciler::Reconciler,
    storage::fs_info,
};
use protocol::{ProtocolLine, install_failure, package_id_from_target, parse_line, remove_failure};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Storage is unavailable (brick mode); command refused")]
    BrickMode,
    #[error("No package or app named {0}")]
    NotFound(String),
    #[error("Removal of {package_id} refused: {app_id} is not removable")]
    RemovalRefused { package_id: String, app_id: String },
    #[error("Storage at {0} is still unavailable")]
    StorageUnavailable(PathBuf),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Executor is not running")]
    ChannelClosed,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Everything a command needs while it runs
#[derive(Clone)]
pub struct ExecutorContext {
    pub config: ExecutorConfig,
    /// Checked before leaving brick mode
    pub storage_root: PathBuf,
    pub relay: Arc<TicketRelay>,
    pub events: Arc<EventBus>,
    pub reconciler: Arc<Reconciler>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSnapshot {
    pub brick_mode: bool,
    /// Ticket of the command currently processing
    pub processing: Option<Ticket>,
    pub pid: Option<u32>,
    /// Every command still in the queue, head first
    pub queue: Vec<Command>,
    /// Tickets whose commands were dropped after a brick interrupt
    pub interrupted: Vec<Ticket>,
    pub history: Vec<CommandRecord>,
}

enum ExecutorMessage {
    Enqueue {
        ticket: Ticket,
        kind: CommandKind,
        reply: oneshot::Sender<ExecutorResult<()>>,
    },
    Spawned {
        command_id: u64,
        pid: Option<u32>,
    },
    /// The tool was reaped; its pid must not be signalled any more
    Exited {
        command_id: u64,
    },
    Finished {
        command_id: u64,
        exit: ExitInfo,
        status: OperationStatus,
    },
    EnterBrick {
        reply: oneshot::Sender<Option<Ticket>>,
    },
    ExitBrick {
        reply: oneshot::Sender<ExecutorResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<ExecutorSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the executor actor
#[derive(Clone)]
pub struct CommandExecutor {
    sender: mpsc::UnboundedSender<ExecutorMessage>,
}

impl CommandExecutor {
    /// Start the actor on the current runtime.
    pub fn spawn(context: ExecutorContext) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = ExecutorActor::new(context, sender.clone());
        tokio::spawn(actor.run(receiver));
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ExecutorMessage,
    ) -> ExecutorResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| ExecutorError::ChannelClosed)?;
        rx.await.map_err(|_| ExecutorError::ChannelClosed)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn install(&self, request: InstallRequest, ticket: Ticket) -> ExecutorResult<()> {
        if request.target.as_os_str().is_empty() {
            return Err(ExecutorError::InvalidRequest("empty install target".into()));
        }
        self.request(|reply| ExecutorMessage::Enqueue {
            ticket,
            kind: CommandKind::Install(request),
            reply,
        })
        .await?
    }

    /// Queue removal of `target`, a package id or an app id. The target is
    /// resolved and the removal policy applied once the command runs, so a
    /// remove queued behind an install sees what that install laid down.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove(&self, target: &str, ticket: Ticket, cause: &str) -> ExecutorResult<()> {
        if target.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest("empty remove target".into()));
        }
        let kind = CommandKind::Remove {
            target: target.to_string(),
            cause: cause.to_string(),
        };
        self.request(|reply| ExecutorMessage::Enqueue {
            ticket,
            kind,
            reply,
        })
        .await?
    }

    /// Returns the ticket of the command that was interrupted, if any.
    pub async fn enter_brick_mode(&self) -> ExecutorResult<Option<Ticket>> {
        self.request(|reply| ExecutorMessage::EnterBrick { reply })
            .await
    }

    pub async fn exit_brick_mode(&self) -> ExecutorResult<()> {
        self.request(|reply| ExecutorMessage::ExitBrick { reply })
            .await?
    }

    pub async fn snapshot(&self) -> ExecutorResult<ExecutorSnapshot> {
        self.request(|reply| ExecutorMessage::Snapshot { reply })
            .await
    }

    /// Kill any running tool and stop the actor. Queued commands are dropped
    /// without a terminal status.
    pub async fn shutdown(&self) -> ExecutorResult<()> {
        self.request(|reply| ExecutorMessage::Shutdown { reply })
            .await
    }
}

struct Running {
    command_id: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct ExecutorActor {
    context: ExecutorContext,
    sender: mpsc::UnboundedSender<ExecutorMessage>,
    queue: VecDeque<Command>,
    running: Option<Running>,
    brick_mode: bool,
    next_command_id: u64,
    interrupted: Vec<Ticket>,
    history: VecDeque<CommandRecord>,
}

impl ExecutorActor {
    fn new(context: ExecutorContext, sender: mpsc::UnboundedSender<ExecutorMessage>) -> Self {
        Self {
            context,
            sender,
            queue: VecDeque::new(),
            running: None,
            brick_mode: false,
            next_command_id: 1,
            interrupted: Vec::new(),
            history: VecDeque::new(),
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ExecutorMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                ExecutorMessage::Enqueue {
                    ticket,
                    kind,
                    reply,
                } => {
                    let _ = reply.send(self.enqueue(ticket, kind));
                }
                ExecutorMessage::Spawned { command_id, pid } => self.on_spawned(command_id, pid),
                ExecutorMessage::Exited { command_id } => self.on_spawned(command_id, None),
                ExecutorMessage::Finished {
                    command_id,
                    exit,
                    status,
                } => self.one_command_processed(command_id, exit, status),
                ExecutorMessage::EnterBrick { reply } => {
                    let _ = reply.send(self.enter_brick_mode());
                }
                ExecutorMessage::ExitBrick { reply } => {
                    let _ = reply.send(self.exit_brick_mode());
                }
                ExecutorMessage::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                ExecutorMessage::Shutdown { reply } => {
                    self.kill_running();
                    self.queue.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("executor stopped");
    }

    fn enqueue(&mut self, ticket: Ticket, kind: CommandKind) -> ExecutorResult<()> {
        if self.brick_mode {
            warn!("refusing {} for ticket {}: brick mode", kind, ticket);
            return Err(ExecutorError::BrickMode);
        }
        let command = Command::new(self.next_command_id, ticket, kind);
        self.next_command_id += 1;
        info!(
            "queued {} {} (ticket {})",
            command.kind,
            CommandRecord::target_of(&command.kind),
            ticket
        );
        self.queue.push_back(command);
        self.context.relay.relay(ticket, OperationStatus::Queued);
        self.try_start_next();
        Ok(())
    }

    fn try_start_next(&mut self) {
        if self.brick_mode || self.running.is_some() {
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.state != CommandState::Queued {
            return;
        }
        head.state = CommandState::Running { pid: None };
        let command = head.clone();
        debug!("starting command {} (ticket {})", command.id, command.ticket);

        let context = self.context.clone();
        let sender = self.sender.clone();
        let command_id = command.id;
        let handle = tokio::spawn(async move {
            let (exit, status) = run_command(&context, &command, &sender).await;
            let _ = sender.send(ExecutorMessage::Finished {
                command_id,
                exit,
                status,
            });
        });
        self.running = Some(Running {
            command_id,
            pid: None,
            started_at: Utc::now(),
            handle,
        });
    }

    fn on_spawned(&mut self, command_id: u64, pid: Option<u32>) {
        let Some(running) = self.running.as_mut().filter(|r| r.command_id == command_id) else {
            return;
        };
        running.pid = pid;
        if let Some(head) = self.queue.front_mut().filter(|c| c.id == command_id) {
            head.state = CommandState::Running { pid };
        }
    }

    /// Completion of the running command: pop it, relay its terminal
    /// status, and start the next one.
    fn one_command_processed(&mut self, command_id: u64, exit: ExitInfo, status: OperationStatus) {
        if self
            .running
            .as_ref()
            .is_none_or(|r| r.command_id != command_id)
        {
            debug!("ignoring stale completion of command {}", command_id);
            return;
        }
        let started_at = self
            .running
            .take()
            .map(|r| r.started_at)
            .unwrap_or_else(Utc::now);
        let Some(mut command) = self.queue.pop_front() else {
            return;
        };
        command.state = CommandState::Completed { exit: exit.clone() };

        match &status {
            OperationStatus::Success => info!("ticket {} succeeded", command.ticket),
            OperationStatus::Failed(code) => {
                warn!("ticket {} ended with {} ({:?})", command.ticket, code, exit);
                let message = format!(
                    "{} {} failed: {}",
                    command.kind,
                    CommandRecord::target_of(&command.kind),
                    code
                );
                let error = ErrorEvent::new("CommandFailed", message, ErrorSeverity::Error)
                .with("ticket", Value::from(command.ticket as i64))
                .with("code", Value::from(code.to_string()));
                if let Err(e) = self.context.events.publish_error(error) {
                    warn!("failed to publish error event: {}", e);
                }
            }
            other => warn!("ticket {} ended with {:?} ({:?})", command.ticket, other, exit),
        }
        self.context.relay.relay(command.ticket, status.clone());

        self.history.push_back(CommandRecord {
            ticket: command.ticket,
            kind: command.kind.to_string(),
            target: CommandRecord::target_of(&command.kind),
            exit,
            status,
            started_at,
            finished_at: Utc::now(),
        });
        while self.history.len() > self.context.config.history_size {
            self.history.pop_front();
        }

        self.try_start_next();
    }

    /// Abort the running command's task. The tool is spawned with
    /// `kill_on_drop`, so dropping the task kills a live child; an already
    /// reaped one is never signalled.
    fn kill_running(&mut self) -> Option<u64> {
        let running = self.running.take()?;
        running.handle.abort();
        match running.pid {
            Some(pid) => debug!("killed tool pid {}", pid),
            None => debug!("aborted command {} with no live tool", running.command_id),
        }
        Some(running.command_id)
    }

    fn enter_brick_mode(&mut self) -> Option<Ticket> {
        if self.brick_mode {
            return None;
        }
        self.brick_mode = true;
        warn!("entering brick mode");
        let interrupted = self.kill_running().and_then(|command_id| {
            let head = self.queue.front_mut().filter(|c| c.id == command_id)?;
            head.state = CommandState::Interrupted;
            warn!(
                "command for ticket {} interrupted, outcome unknown",
                head.ticket
            );
            Some(head.ticket)
        });
        let _ = self
            .context
            .events
            .publish(Event::new(EventType::BrickModeChanged { active: true }));
        interrupted
    }

    fn exit_brick_mode(&mut self) -> ExecutorResult<()> {
        if !self.brick_mode {
            return Ok(());
        }
        if let Err(e) = fs_info::validate_storage(&self.context.storage_root) {
            warn!("cannot leave brick mode: {}", e);
            return Err(ExecutorError::StorageUnavailable(
                self.context.storage_root.clone(),
            ));
        }
        while let Some(head) = self.queue.front() {
            if head.state != CommandState::Interrupted {
                break;
            }
            self.interrupted.push(head.ticket);
            // outcome unknown: the ticket is closed without a terminal status
            self.context.relay.release(head.ticket);
            self.queue.pop_front();
        }
        self.brick_mode = false;
        info!("leaving brick mode, {} commands queued", self.queue.len());
        let _ = self
            .context
            .events
            .publish(Event::new(EventType::BrickModeChanged { active: false }));
        self.try_start_next();
        Ok(())
    }

    fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            brick_mode: self.brick_mode,
            processing: self.running.as_ref().and_then(|r| {
                self.queue
                    .iter()
                    .find(|c| c.id == r.command_id)
                    .map(|c| c.ticket)
            }),
            pid: self.running.as_ref().and_then(|r| r.pid),
            queue: self.queue.iter().cloned().collect(),
            interrupted: self.interrupted.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Run one command to completion and return how the tool ended together
/// with the terminal status to relay.
async fn run_command(
    context: &ExecutorContext,
    command: &Command,
    sender: &mpsc::UnboundedSender<ExecutorMessage>,
) -> (ExitInfo, OperationStatus) {
    match &command.kind {
        CommandKind::Install(request) => run_install(context, command, request, sender).await,
        CommandKind::Remove { target, cause } => {
            let planned = {
                let store = context.reconciler.store().read().await;
                plan_removal(&store, target)
            };
            match planned {
                Ok(plan) => run_remove(context, command, &plan, cause, sender).await,
                Err(e) => {
                    warn!("remove of {} not run: {}", target, e);
                    (ExitInfo::NotRun, OperationStatus::Failed(refusal_code(&e)))
                }
            }
        }
    }
}

async fn run_install(
    context: &ExecutorContext,
    command: &Command,
    request: &InstallRequest,
    sender: &mpsc::UnboundedSender<ExecutorMessage>,
) -> (ExitInfo, OperationStatus) {
    let mut tool = ToolCommand::new(&context.config.install_tool);
    tool.arg("install")
        .arg(&request.target)
        .arg("--uncompressed-size")
        .arg(request.uncompressed_size_kb.to_string());
    if request.verify {
        tool.arg("--verify");
    }
    if request.system {
        tool.arg("--system");
    }

    let (exit, package_line) = run_tool(context, command, tool, sender).await;
    if let Some(code) = install_failure(&exit) {
        return (exit, OperationStatus::Failed(code));
    }

    let package_id = package_line.or_else(|| package_id_from_target(&request.target));
    match package_id {
        Some(id) => {
            if let Err(e) = context.reconciler.post_install_scan(&id).await {
                error!("rescan after installing {} failed: {}", id, e);
            }
        }
        None => warn!(
            "cannot tell which package {} installed",
            request.target.display()
        ),
    }
    (exit, OperationStatus::Success)
}

/// Terminal code for a remove that was settled before the tool ran
fn refusal_code(error: &ExecutorError) -> FailureCode {
    match error {
        ExecutorError::NotFound(_) => FailureCode::InvalidArgs,
        _ => FailureCode::IpkgRemoveFailed,
    }
}

async fn run_remove(
    context: &ExecutorContext,
    command: &Command,
    plan: &RemovePlan,
    cause: &str,
    sender: &mpsc::UnboundedSender<ExecutorMessage>,
) -> (ExitInfo, OperationStatus) {
    info!(
        "removing {} ({}, cause: {})",
        plan.package_id, plan.mode, cause
    );
    context
        .relay
        .relay(command.ticket, OperationStatus::progress(InstallPhase::Removing));

    if let Some(folder) = &plan.folder {
        run_pre_remove_script(context, folder).await;
    }

    let exit = match plan.mode {
        RemoveMode::HideOnly => {
            for app_id in &plan.app_ids {
                if let Err(e) = context.reconciler.hide_app(app_id).await {
                    error!("hiding {} failed: {}", app_id, e);
                    return (ExitInfo::Exited(0), OperationStatus::Failed(FailureCode::IpkgRemoveFailed));
                }
            }
            return (ExitInfo::Exited(0), OperationStatus::Success);
        }
        RemoveMode::Shallow => ExitInfo::Exited(0),
        RemoveMode::Full => {
            let mut tool = ToolCommand::new(&context.config.remove_tool);
            tool.arg("remove").arg(&plan.package_id);
            let (exit, _) = run_tool(context, command, tool, sender).await;
            for dir in &plan.install_dirs {
                match tokio::fs::remove_dir_all(dir).await {
                    Ok(()) => debug!("deleted {}", dir.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to delete {}: {}", dir.display(), e),
                }
            }
            exit
        }
    };

    if let Err(e) = context.reconciler.remove_package_records(plan, cause).await {
        error!("bookkeeping for {} failed: {}", plan.package_id, e);
    }
    match remove_failure(&exit) {
        Some(code) => (exit, OperationStatus::Failed(code)),
        None => (exit, OperationStatus::Success),
    }
}

async fn run_pre_remove_script(context: &ExecutorContext, folder: &std::path::Path) {
    let script = folder.join(&context.config.pre_remove_script);
    if !script.is_file() {
        return;
    }
    debug!("running pre-remove script {}", script.display());
    let result = ToolCommand::new("/bin/sh")
        .arg(&script)
        .current_dir(folder)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("pre-remove script {} exited with {}", script.display(), status),
        Err(e) => warn!("pre-remove script {} failed to start: {}", script.display(), e),
    }
}

/// Spawn the tool, relay its status lines and wait for it. Returns the exit
/// and the package id the tool announced, if any.
async fn run_tool(
    context: &ExecutorContext,
    command: &Command,
    mut tool: ToolCommand,
    sender: &mpsc::UnboundedSender<ExecutorMessage>,
) -> (ExitInfo, Option<String>) {
    tool.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match tool.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to spawn packaging tool: {}", e);
            return (ExitInfo::SpawnFailed(e.to_string()), None);
        }
    };
    let _ = sender.send(ExecutorMessage::Spawned {
        command_id: command.id,
        pid: child.id(),
    });

    let ticket = command.ticket;
    let command_id = command.id;
    let exited = sender.clone();
    let relay = context.relay.clone();
    let stdout = child.stdout.take();
    let work = async move {
        let mut package = None;
        if let Some(stdout) = stdout {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(Ok(line)) = lines.next().await {
                match parse_line(&line) {
                    ProtocolLine::Status { phase, detail } => {
                        relay.relay(ticket, OperationStatus::Progress { phase, detail });
                    }
                    ProtocolLine::Package(id) => package = Some(id),
                    ProtocolLine::Other(text) => debug!("tool: {}", text),
                }
            }
        }
        let exit = match child.wait().await {
            Ok(status) => ExitInfo::from(status),
            Err(e) => ExitInfo::SpawnFailed(e.to_string()),
        };
        let _ = exited.send(ExecutorMessage::Exited { command_id });
        (exit, package)
    };

    let timeout = context.config.tool_timeout;
    if timeout == Duration::ZERO {
        return work.await;
    }
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            // the child is dropped with the future and killed
            warn!("packaging tool exceeded {:?}, killed", timeout);
            (ExitInfo::TimedOut, None)
        }
    }
}
