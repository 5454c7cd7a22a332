//! Process supervisor for one VM.
//!
//! ## Architecture
//!
//! ```text
//! SupervisorHandle ──Request──► actor task (owns config, child, monitor, lifecycle)
//!        ▲                          │   ▲
//!        │ SupervisorEvent          │   │ internal requests tagged with the
//!        └──── broadcast ◄──────────┘   │ session generation
//!                                       │
//!        waiter task (child.wait / kill) ┤
//!        timers (monitor, powerdown, forced cleanup, preview)
//!        monitor connect task ───────────┘
//! ```
//!
//! Every state change and every monitor send happens inside the actor, so
//! operations issued in quick succession are applied in order. Timers only
//! post requests back into the queue; a request from an older session
//! (different generation) is ignored.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStore, VmConfig};
use crate::error::{MonitorError, SupervisorError};
use crate::settings::Settings;
use crate::state_machine::lifecycle_sm::{Lifecycle, LifecycleEvent, Operation, VmState};
use crate::vm::launch::{self, LaunchMode};
use crate::vm::monitor::{EventSink, MonitorClient};
use crate::vm::preview::{self, PreviewImage};
use crate::vm::qmp::{QmpCommand, QmpEvent};

/// Capacity of the observer channel. Slow observers miss old events.
const EVENT_CAPACITY: usize = 64;

/// Poll interval of the post-spawn liveness check.
const LIVENESS_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Notifications delivered to observers.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Emitted on every transition, and to resynchronise after a rejected
    /// operation.
    StateChanged(VmState),
    ConfigurationReplaced(VmConfig),
    ConfigurationDeleted(String),
    PreviewReady(PreviewImage),
    /// Telemetry from the monitor channel. Never changes the lifecycle.
    Monitor(QmpEvent),
}

/// Result of [`SupervisorHandle::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32>, monitor_port: u16 },
    /// A process already existed; it was terminated and nothing new was
    /// launched.
    StoppedExisting,
}

/// Result of an operation that is only valid in some states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Done,
    /// Not enabled in the current state; nothing happened.
    Ignored,
    /// Accepted, but takes effect when the current session ends.
    Deferred,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub vm_name: String,
    pub state: VmState,
    pub pid: Option<u32>,
    pub monitor_port: Option<u16>,
    pub monitor_attached: bool,
}

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

enum Request {
    Start { mode: LaunchMode, reply: Reply<StartOutcome> },
    Pause { reply: Reply<OperationOutcome> },
    Resume { reply: Reply<OperationOutcome> },
    Stop { reply: Reply<OperationOutcome> },
    Terminate { reply: Reply<OperationOutcome> },
    Screendump { reply: Reply<PathBuf> },
    ReplaceConfig { config: Box<VmConfig>, reply: Reply<OperationOutcome> },
    Delete { reply: Reply<()> },
    Status { reply: oneshot::Sender<SupervisorStatus> },
    Shutdown { reply: oneshot::Sender<()> },

    ProcessExited { generation: u64, status: Option<ExitStatus> },
    MonitorDue { generation: u64 },
    MonitorReady { generation: u64, result: Result<MonitorClient, MonitorError> },
    DeferredPowerdown { generation: u64 },
    ForcedCleanup { generation: u64 },
    PreviewDue { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupReason {
    /// Stop timeout or explicit terminate.
    Forced,
    /// The process exited on its own.
    Exited,
    /// `start` was called while a process existed.
    Restart,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: VmConfig, settings: Settings, store: ConfigStore) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let supervisor = Supervisor {
            lifecycle: Lifecycle::new(config.name.clone()),
            config,
            settings,
            store,
            pending_config: None,
            process: None,
            monitor: None,
            next_generation: 1,
            events: events.clone(),
            queue: tx.downgrade(),
        };
        tokio::spawn(supervisor.run(rx));

        Self { tx, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| SupervisorError::Gone)?;
        rx.await.map_err(|_| SupervisorError::Gone)?
    }

    pub async fn start(&self, mode: LaunchMode) -> Result<StartOutcome, SupervisorError> {
        self.request(|reply| Request::Start { mode, reply }).await
    }

    pub async fn pause(&self) -> Result<OperationOutcome, SupervisorError> {
        self.request(|reply| Request::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<OperationOutcome, SupervisorError> {
        self.request(|reply| Request::Resume { reply }).await
    }

    /// Request a graceful powerdown. Cleanup follows after the forced-cleanup
    /// delay whether or not the guest complied.
    pub async fn stop(&self) -> Result<OperationOutcome, SupervisorError> {
        self.request(|reply| Request::Stop { reply }).await
    }

    /// Kill the process and clean up immediately. Works without a monitor.
    pub async fn terminate(&self) -> Result<OperationOutcome, SupervisorError> {
        self.request(|reply| Request::Terminate { reply }).await
    }

    /// Ask the engine for a screendump; `PreviewReady` follows shortly.
    pub async fn screendump(&self) -> Result<PathBuf, SupervisorError> {
        self.request(|reply| Request::Screendump { reply }).await
    }

    pub async fn replace_config(&self, config: VmConfig) -> Result<OperationOutcome, SupervisorError> {
        self.request(|reply| Request::ReplaceConfig {
            config: Box::new(config),
            reply,
        })
        .await
    }

    /// Remove the persisted record and nvram, terminating any process first.
    pub async fn delete(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Request::Delete { reply }).await
    }

    pub async fn status(&self) -> Result<SupervisorStatus, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Status { reply })
            .map_err(|_| SupervisorError::Gone)?;
        rx.await.map_err(|_| SupervisorError::Gone)
    }

    /// Terminate any session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Shutdown { reply })
            .map_err(|_| SupervisorError::Gone)?;
        rx.await.map_err(|_| SupervisorError::Gone)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// The live engine process of one session.
struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    monitor_port: u16,
    /// Dropping or firing this makes the waiter task kill the child.
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            // Fails only when the waiter already saw the exit.
            let _ = kill.send(());
        }
    }
}

struct Supervisor {
    config: VmConfig,
    settings: Settings,
    store: ConfigStore,
    lifecycle: Lifecycle,
    /// Same-name record received while running; applied at cleanup.
    pending_config: Option<VmConfig>,
    process: Option<ProcessHandle>,
    monitor: Option<MonitorClient>,
    next_generation: u64,
    events: broadcast::Sender<SupervisorEvent>,
    queue: mpsc::WeakUnboundedSender<Request>,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        info!(vm = %self.config.name, "supervisor started");

        while let Some(request) = rx.recv().await {
            match request {
                Request::Start { mode, reply } => {
                    let _ = reply.send(self.start(mode).await);
                }
                Request::Pause { reply } => {
                    let _ = reply.send(self.pause().await);
                }
                Request::Resume { reply } => {
                    let _ = reply.send(self.resume().await);
                }
                Request::Stop { reply } => {
                    let _ = reply.send(self.stop().await);
                }
                Request::Terminate { reply } => {
                    let outcome = if self.cleanup(CleanupReason::Forced, None).await {
                        OperationOutcome::Done
                    } else {
                        OperationOutcome::Ignored
                    };
                    let _ = reply.send(Ok(outcome));
                }
                Request::Screendump { reply } => {
                    let _ = reply.send(self.screendump().await);
                }
                Request::ReplaceConfig { config, reply } => {
                    let _ = reply.send(self.replace_config(*config).await);
                }
                Request::Delete { reply } => {
                    let _ = reply.send(self.delete().await);
                }
                Request::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Request::Shutdown { reply } => {
                    self.cleanup(CleanupReason::Shutdown, None).await;
                    let _ = reply.send(());
                    break;
                }
                Request::ProcessExited { generation, status } => {
                    self.on_process_exited(generation, status).await;
                }
                Request::MonitorDue { generation } => self.on_monitor_due(generation),
                Request::MonitorReady { generation, result } => {
                    self.on_monitor_ready(generation, result).await;
                }
                Request::DeferredPowerdown { generation } => {
                    self.on_deferred_powerdown(generation).await;
                }
                Request::ForcedCleanup { generation } => {
                    self.cleanup(CleanupReason::Forced, Some(generation)).await;
                }
                Request::PreviewDue { path } => match PreviewImage::load(&path) {
                    Ok(image) => self.emit(SupervisorEvent::PreviewReady(image)),
                    Err(e) => debug!(path = %path.display(), error = %e, "preview not available"),
                },
            }
        }

        if let Some(process) = self.process.take() {
            warn!(vm = %self.config.name, "supervisor dropped with a live process; terminating");
            process.terminate();
        }
        info!(vm = %self.config.name, "supervisor finished");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn state(&self) -> VmState {
        self.lifecycle.state()
    }

    fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn notify_state(&self) {
        self.emit(SupervisorEvent::StateChanged(self.state()));
    }

    fn transition(&mut self, event: LifecycleEvent) {
        let before = self.state();
        if self.lifecycle.apply(event) {
            info!(vm = %self.config.name, from = %before, to = %self.state(), "state changed");
        }
        self.notify_state();
    }

    fn is_live(&self, generation: u64) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.generation == generation)
    }

    /// Post `request` back into the queue after `delay`.
    fn schedule(&self, delay: Duration, request: Request) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = queue.upgrade() {
                let _ = tx.send(request);
            }
        });
    }

    async fn send(&mut self, command: QmpCommand) -> Result<(), MonitorError> {
        let monitor = self.monitor.as_mut().ok_or(MonitorError::Closed)?;
        monitor.send(&command).await.inspect_err(|e| {
            warn!(vm = %self.config.name, command = command.name(), error = %e, "monitor send failed");
        })
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            vm_name: self.config.name.clone(),
            state: self.state(),
            pid: self.process.as_ref().and_then(|p| p.pid),
            monitor_port: self.process.as_ref().map(|p| p.monitor_port),
            monitor_attached: self.monitor.is_some(),
        }
    }

    /// Close the monitor now and drop the client a little later, so a send
    /// racing the close sees a closed writer rather than a freed client.
    async fn release_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.close().await;
            let delay = self.settings.timings.channel_release_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                drop(monitor);
            });
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    async fn start(&mut self, mode: LaunchMode) -> Result<StartOutcome, SupervisorError> {
        if self.process.is_some() {
            info!(vm = %self.config.name, "start requested with a live process; stopping it");
            self.cleanup(CleanupReason::Restart, None).await;
            return Ok(StartOutcome::StoppedExisting);
        }

        let spec = launch::build(
            &self.config,
            mode,
            &self.settings.firmware_path,
            self.settings.monitor_ports(),
        )?;
        let engine = self.settings.engine_for(&self.config.architecture)?;

        let generation = self.next_generation;
        self.next_generation += 1;

        let mut command = Command::new(&engine);
        command.args(&spec.args).kill_on_drop(true);
        match mode {
            LaunchMode::Headless => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            LaunchMode::Normal => {
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped());
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(vm = %self.config.name, engine = %engine.display(), error = %e, "failed to spawn engine");
                self.notify_state();
                return Err(SupervisorError::SpawnFailure(e));
            }
        };

        if let Err(e) = confirm_alive(&mut child, self.settings.timings.liveness_timeout()).await {
            error!(vm = %self.config.name, error = %e, "engine did not come up");
            self.notify_state();
            return Err(e);
        }

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            let name = self.config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "engine", vm = %name, "{}", line);
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_process(child, generation, kill_rx, self.queue.clone()));

        self.process = Some(ProcessHandle {
            generation,
            pid,
            monitor_port: spec.monitor_port,
            kill: Some(kill_tx),
        });
        info!(
            vm = %self.config.name,
            pid = ?pid,
            port = spec.monitor_port,
            generation,
            headless = (mode == LaunchMode::Headless),
            "engine started"
        );

        // Observers learn about Running before the monitor exists.
        self.transition(LifecycleEvent::Started);
        self.schedule(
            self.settings.timings.monitor_connect_delay(),
            Request::MonitorDue { generation },
        );

        Ok(StartOutcome::Started {
            pid,
            monitor_port: spec.monitor_port,
        })
    }

    fn on_monitor_due(&mut self, generation: u64) {
        let Some(process) = self.process.as_ref().filter(|p| p.generation == generation) else {
            debug!(vm = %self.config.name, generation, "process gone before monitor connect");
            return;
        };
        let port = process.monitor_port;
        let attempts = self.settings.timings.monitor_connect_attempts;
        let backoff = self.settings.timings.monitor_retry_backoff();
        let events = self.events.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = events.send(SupervisorEvent::Monitor(event));
        });
        let queue = self.queue.clone();

        tokio::spawn(async move {
            let result = MonitorClient::connect_with_retry(port, attempts, backoff, sink).await;
            if let Some(tx) = queue.upgrade() {
                let _ = tx.send(Request::MonitorReady { generation, result });
            }
        });
    }

    async fn on_monitor_ready(
        &mut self,
        generation: u64,
        result: Result<MonitorClient, MonitorError>,
    ) {
        match result {
            Ok(mut client) => {
                if self.is_live(generation) && self.monitor.is_none() {
                    info!(vm = %self.config.name, port = client.port(), "monitor attached");
                    self.monitor = Some(client);
                } else {
                    debug!(vm = %self.config.name, generation, "discarding monitor for a finished session");
                    client.close().await;
                }
            }
            Err(e) => {
                // The VM keeps running without a control channel.
                warn!(vm = %self.config.name, error = %e, "monitor connection failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pause / resume / stop
    // -----------------------------------------------------------------------

    fn rejected(&self, op: Operation) -> Result<OperationOutcome, SupervisorError> {
        debug!(vm = %self.config.name, op = ?op, state = %self.state(), "operation not enabled");
        self.notify_state();
        Ok(OperationOutcome::Ignored)
    }

    async fn pause(&mut self) -> Result<OperationOutcome, SupervisorError> {
        if !self.state().allows(Operation::Pause) {
            return self.rejected(Operation::Pause);
        }
        self.send(QmpCommand::Stop).await?;
        self.transition(LifecycleEvent::Paused);
        Ok(OperationOutcome::Done)
    }

    async fn resume(&mut self) -> Result<OperationOutcome, SupervisorError> {
        if !self.state().allows(Operation::Resume) {
            return self.rejected(Operation::Resume);
        }
        self.send(QmpCommand::Cont).await?;
        self.transition(LifecycleEvent::Resumed);
        Ok(OperationOutcome::Done)
    }

    async fn stop(&mut self) -> Result<OperationOutcome, SupervisorError> {
        if !self.state().allows(Operation::Stop) {
            return self.rejected(Operation::Stop);
        }
        let Some(generation) = self.process.as_ref().map(|p| p.generation) else {
            return self.rejected(Operation::Stop);
        };

        // The forced cleanup runs whether or not the guest acknowledges the
        // powerdown. From Paused it is armed by the deferred powerdown, so the
        // powerdown always goes out first.
        let sent = if self.state() == VmState::Paused {
            let sent = self.send(QmpCommand::Cont).await;
            self.schedule(
                self.settings.timings.powerdown_delay(),
                Request::DeferredPowerdown { generation },
            );
            sent
        } else {
            let sent = self.send(QmpCommand::SystemPowerdown).await;
            self.schedule_forced_cleanup(generation);
            sent
        };
        info!(vm = %self.config.name, graceful = sent.is_ok(), "stop requested");

        sent?;
        Ok(OperationOutcome::Done)
    }

    async fn on_deferred_powerdown(&mut self, generation: u64) {
        if !self.is_live(generation) {
            return;
        }
        if let Err(e) = self.send(QmpCommand::SystemPowerdown).await {
            warn!(vm = %self.config.name, error = %e, "deferred powerdown failed");
        }
        self.schedule_forced_cleanup(generation);
    }

    fn schedule_forced_cleanup(&self, generation: u64) {
        self.schedule(
            self.settings.timings.forced_cleanup_delay(),
            Request::ForcedCleanup { generation },
        );
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    async fn on_process_exited(&mut self, generation: u64, status: Option<ExitStatus>) {
        if !self.is_live(generation) {
            debug!(vm = %self.config.name, generation, "exit of a finished session");
            return;
        }
        info!(vm = %self.config.name, status = ?status, "engine process exited");
        self.cleanup(CleanupReason::Exited, Some(generation)).await;
    }

    /// Tear down the current session. Safe to call any number of times;
    /// returns whether there was anything to clean up.
    async fn cleanup(&mut self, reason: CleanupReason, generation: Option<u64>) -> bool {
        if let (Some(generation), Some(process)) = (generation, self.process.as_ref()) {
            if process.generation != generation {
                debug!(vm = %self.config.name, generation, "ignoring cleanup for an older session");
                return false;
            }
        }
        if self.process.is_none() && self.monitor.is_none() && self.state() == VmState::Stopped {
            debug!(vm = %self.config.name, reason = ?reason, "nothing to clean up");
            return false;
        }

        if let Some(process) = self.process.take() {
            if reason != CleanupReason::Exited {
                info!(vm = %self.config.name, pid = ?process.pid, reason = ?reason, "terminating engine");
            }
            process.terminate();
        }

        self.lifecycle.apply(LifecycleEvent::Cleanup);
        self.release_monitor().await;

        if let Some(pending) = self.pending_config.take() {
            info!(vm = %pending.name, "applying configuration received during the session");
            self.config = pending;
            self.emit(SupervisorEvent::ConfigurationReplaced(self.config.clone()));
        }
        self.config.reset_cd_mounts();
        if let Err(e) = self.store.save(&self.config) {
            warn!(vm = %self.config.name, error = %e, "could not persist VM record after stop");
        }

        info!(vm = %self.config.name, reason = ?reason, "session cleaned up");
        self.notify_state();
        true
    }

    // -----------------------------------------------------------------------
    // Configuration, preview, delete
    // -----------------------------------------------------------------------

    async fn screendump(&mut self) -> Result<PathBuf, SupervisorError> {
        let path = preview::screendump_path(&self.config.main_image);
        self.send(QmpCommand::Screendump {
            filename: path.clone(),
        })
        .await?;
        self.schedule(
            self.settings.timings.preview_delay(),
            Request::PreviewDue { path: path.clone() },
        );
        Ok(path)
    }

    async fn replace_config(&mut self, config: VmConfig) -> Result<OperationOutcome, SupervisorError> {
        if self.state() == VmState::Stopped && self.process.is_none() {
            info!(from = %self.config.name, to = %config.name, "configuration replaced");
            self.lifecycle = Lifecycle::new(config.name.clone());
            self.pending_config = None;
            self.config = config;
            self.emit(SupervisorEvent::ConfigurationReplaced(self.config.clone()));
            self.notify_state();
            return Ok(OperationOutcome::Done);
        }

        if config.name != self.config.name {
            return Err(SupervisorError::ConfigLocked {
                current: self.config.name.clone(),
                requested: config.name,
            });
        }

        // Same VM while it runs: keep the session and the new record for
        // cleanup, refresh the view now.
        debug!(vm = %config.name, "configuration change deferred until stop");
        self.pending_config = Some(config);
        if self.monitor.is_some() {
            if let Err(e) = self.screendump().await {
                debug!(vm = %self.config.name, error = %e, "preview refresh failed");
            }
        }
        self.notify_state();
        Ok(OperationOutcome::Deferred)
    }

    async fn delete(&mut self) -> Result<(), SupervisorError> {
        if self.process.is_some() {
            warn!(vm = %self.config.name, "deleting a VM with a live process; terminating");
        }
        // Observers hear about Stopped even if removing the files fails.
        self.cleanup(CleanupReason::Forced, None).await;

        self.store.delete(&self.config)?;
        self.emit(SupervisorEvent::ConfigurationDeleted(self.config.name.clone()));
        self.notify_state();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

/// Bounded wait until the OS reports the child as running.
async fn confirm_alive(child: &mut Child, timeout: Duration) -> Result<(), SupervisorError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(None) if child.id().is_some() => return Ok(()),
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(SupervisorError::SpawnFailure(std::io::Error::other(format!(
                    "engine exited during startup: {status}"
                ))));
            }
            Err(e) => return Err(SupervisorError::SpawnFailure(e)),
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(SupervisorError::SpawnFailure(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "engine did not report running in time",
            )));
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }
}

/// Own the child until it exits, killing it if the session asks (or the
/// handle is dropped). Reports the exit for this generation only.
async fn watch_process(
    mut child: Child,
    generation: u64,
    kill: oneshot::Receiver<()>,
    queue: mpsc::WeakUnboundedSender<Request>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill => {
            if let Err(e) = child.kill().await {
                debug!(generation, error = %e, "kill failed; process likely gone");
            }
            child.wait().await.ok()
        }
    };
    if let Some(tx) = queue.upgrade() {
        let _ = tx.send(Request::ProcessExited { generation, status });
    }
}
