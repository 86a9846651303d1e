use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::events::{EventSink, SupervisorEvent};
use crate::ipc::{ChildChannel, DnsBridge, DnsResolver, IpcEndpoint, IpcResponse};
use crate::logs::{LogManager, LogPage, LogStats};
use crate::process::monitor::{
    ConnectionEvent, ConnectionStatus, LineBuffer, MarkerClassifier, OutputMonitor, Terminate,
};
use crate::process::restart::{ExitContext, RestartPolicy};
use crate::process::spawner::{signal_process, spawn_analysis, LaunchSpec};
use crate::process::types::{ChildHandle, ProcessSnapshot, ProcessState, ProcessStatus, RunState};
use crate::service::AnalysisService;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for buffered output after the process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK_SIZE: usize = 8192;

/// Supervises the process of a single analysis
///
/// Cheap to clone; all clones share the same state. Background tasks (output
/// readers, exit watcher, restart timer) hold clones as well.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    analysis_id: String,
    analysis_name: String,
    config: SupervisorConfig,
    policy: RestartPolicy,
    service: Arc<dyn AnalysisService>,
    bridge: DnsBridge,
    events: Arc<dyn EventSink>,
    state: Mutex<ProcessState>,
    monitor: OutputMonitor,
    logs: AsyncMutex<LogManager>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Terminate for Inner {
    fn terminate(&self, reason: &str) {
        let state = self.state();
        match state.handle.as_ref() {
            Some(handle) => {
                info!(
                    "Terminating analysis {} (pid {}): {}",
                    self.analysis_id, handle.pid, reason
                );
                if !handle.signal(Signal::SIGTERM) {
                    debug!("Analysis {} already exited", self.analysis_id);
                }
            }
            None => debug!(
                "Analysis {} has no running process to terminate ({})",
                self.analysis_id, reason
            ),
        }
    }
}

/// IPC route to one specific child generation
struct GenerationChannel {
    inner: Weak<Inner>,
    generation: u64,
}

impl ChildChannel for GenerationChannel {
    fn sender(&self) -> Option<mpsc::UnboundedSender<IpcResponse>> {
        let inner = self.inner.upgrade()?;
        let sender = {
            let state = inner.state();
            state
                .handle
                .as_ref()
                .filter(|handle| handle.generation == self.generation)
                .map(|handle| handle.ipc_tx.clone())
        };
        sender
    }
}

impl ProcessSupervisor {
    /// Create a supervisor in the stopped state
    ///
    /// Call [`ProcessSupervisor::initialize_log_state`] before the first
    /// start to pick up the log history of a previous run.
    pub fn new(
        analysis_id: impl Into<String>,
        analysis_name: impl Into<String>,
        config: SupervisorConfig,
        service: Arc<dyn AnalysisService>,
        resolver: Arc<dyn DnsResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let analysis_id = analysis_id.into();
        let logs = LogManager::new(
            analysis_id.clone(),
            config.log_path(&analysis_id),
            config.max_memory_logs,
            config.max_log_file_size,
            Arc::clone(&events),
        );
        let monitor = OutputMonitor::new(
            analysis_id.clone(),
            Box::new(MarkerClassifier::new(&config.markers)),
            config.grace_period(),
        );

        Self {
            inner: Arc::new(Inner {
                analysis_id,
                analysis_name: analysis_name.into(),
                policy: RestartPolicy::from_config(&config.restart),
                config,
                service,
                bridge: DnsBridge::new(resolver),
                events,
                state: Mutex::new(ProcessState::new()),
                monitor,
                logs: AsyncMutex::new(logs),
            }),
        }
    }

    pub fn analysis_id(&self) -> &str {
        &self.inner.analysis_id
    }

    pub fn analysis_name(&self) -> &str {
        &self.inner.analysis_name
    }

    pub async fn initialize_log_state(&self) -> Result<()> {
        self.inner.logs.lock().await.initialize_log_state().await
    }

    /// Start the analysis process
    ///
    /// Does nothing when a process is already running or being started.
    /// A `stop()` or `cleanup()` arriving before the process is in place
    /// cancels the start, killing the process if it was already spawned.
    pub async fn start(&self) -> Result<()> {
        let epoch = {
            let mut state = self.inner.state();
            if state.is_starting || state.handle.is_some() {
                debug!(
                    "Analysis {} is already running or starting",
                    self.inner.analysis_id
                );
                return Ok(());
            }
            state.is_starting = true;
            state.start_epoch
        };

        match self.launch(epoch).await {
            Ok(Some(pid)) => {
                info!("Started analysis {} (pid {})", self.inner.analysis_id, pid);
                Ok(())
            }
            Ok(None) => {
                debug!(
                    "Start of analysis {} was cancelled",
                    self.inner.analysis_id
                );
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.inner.state();
                    if state.start_epoch == epoch {
                        state.is_starting = false;
                    }
                }
                error!("Failed to start analysis {}: {}", self.inner.analysis_id, e);
                self.add_log(format!("Failed to start analysis: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Restart timers go through here. The boxed future has a nameable type,
    /// which `start` (whose exit watcher schedules those timers) cannot have.
    fn start_boxed(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.start())
    }

    fn start_cancelled(&self, epoch: u64) -> bool {
        self.inner.state().start_epoch != epoch
    }

    async fn launch(&self, epoch: u64) -> Result<Option<u32>> {
        let analysis_id = self.inner.analysis_id.clone();
        let env = self.inner.service.get_environment(&analysis_id).await?;
        if self.start_cancelled(epoch) {
            return Ok(None);
        }
        let launch = LaunchSpec::new(&self.inner.config, &analysis_id, env);

        let mut spawned = spawn_analysis(&launch)?;
        let pid = spawned.pid;
        let endpoint = match IpcEndpoint::from_std(spawned.ipc) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = spawned.child.start_kill();
                return Err(e);
            }
        };
        let stdout = spawned.child.stdout.take();
        let stderr = spawned.child.stderr.take();

        let (ipc_tx, ipc_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let installed = {
            let mut state = self.inner.state();
            if state.start_epoch != epoch {
                None
            } else {
                state.generation += 1;
                state.handle = Some(ChildHandle {
                    generation: state.generation,
                    pid,
                    ipc_tx,
                    signals: signal_tx,
                    exited: exited_rx,
                });
                state.run_state = RunState::Running;
                state.enabled = true;
                state.is_starting = false;
                state.is_manual_stop = false;
                state.exit_code = None;
                state.last_start_time = Some(Utc::now());
                if let Some(pending) = state.pending_restart.take() {
                    pending.abort();
                }
                Some(state.generation)
            }
        };

        let Some(generation) = installed else {
            debug!(
                "Analysis {} was stopped while starting, killing pid {}",
                analysis_id, pid
            );
            let mut child = spawned.child;
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(None);
        };

        // Connection tracking restarts from scratch for every process
        self.inner.monitor.reset_connection_state();

        let channel: Arc<dyn ChildChannel> = Arc::new(GenerationChannel {
            inner: Arc::downgrade(&self.inner),
            generation,
        });
        endpoint.spawn(
            analysis_id,
            self.inner.bridge.clone(),
            channel,
            ipc_rx,
        );

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(self.clone().read_output(stdout)));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(self.clone().read_output(stderr)));
        }
        tokio::spawn(self.clone().watch_exit(
            spawned.child,
            pid,
            generation,
            signal_rx,
            readers,
            exited_tx,
        ));

        self.add_log(format!("Analysis started (pid {})", pid)).await;
        self.broadcast_status();
        self.save_config().await;

        Ok(Some(pid))
    }

    async fn read_output<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        self.handle_output_line(line).await;
                    }
                }
                Err(e) => {
                    debug!(
                        "Output stream of analysis {} failed: {}",
                        self.inner.analysis_id, e
                    );
                    break;
                }
            }
        }

        if let Some(line) = buffer.finish() {
            self.handle_output_line(line).await;
        }
    }

    async fn handle_output_line(&self, line: String) {
        let terminator: Arc<dyn Terminate> = self.inner.clone();
        let event = self.inner.monitor.handle_line(&line, terminator);
        self.add_log(line).await;

        if event == Some(ConnectionEvent::Connected) {
            let mut state = self.inner.state();
            if state.restart.attempts() > 0 {
                info!(
                    "Analysis {} connected, resetting {} restart attempt(s)",
                    self.inner.analysis_id,
                    state.restart.attempts()
                );
            }
            state.restart.reset();
        }
    }

    async fn watch_exit(
        self,
        mut child: Child,
        pid: u32,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        readers: Vec<JoinHandle<()>>,
        exited_tx: watch::Sender<bool>,
    ) {
        let waited = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => {
                    // Not reaped yet, so the pid still belongs to this child
                    if let Err(e) = signal_process(pid, signal) {
                        warn!("{}", e);
                    }
                }
            }
        };

        let code = match waited {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(
                    "Failed to wait for analysis {}: {}",
                    self.inner.analysis_id, e
                );
                None
            }
        };

        // Let the readers log what the process wrote right before exiting
        for reader in readers {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(
                    "Output of analysis {} still open after exit",
                    self.inner.analysis_id
                );
            }
        }

        let current = self.inner.state().handle.as_ref().map(|h| h.generation);
        if current == Some(generation) {
            self.handle_exit(code).await;
        } else {
            debug!(
                "Ignoring exit of a replaced process of analysis {}",
                self.inner.analysis_id
            );
        }

        let _ = exited_tx.send(true);
    }

    /// React to the exit of the current process
    ///
    /// `code` is `None` when the process was killed by a signal. After a
    /// manual stop that is reported as exit code 0.
    pub async fn handle_exit(&self, code: Option<i32>) {
        let connection = self.inner.monitor.connection_status();

        let (exit_code, manual, restart_delay) = {
            let mut state = self.inner.state();
            let manual = state.is_manual_stop;
            state.is_manual_stop = false;

            let exit_code = if manual { code.or(Some(0)) } else { code };
            state.handle = None;
            state.exit_code = exit_code;
            state.last_stop_time = Some(Utc::now());

            let exit = ExitContext {
                manual_stop: manual,
                intended_running: state.run_state.intended_state() == ProcessStatus::Running,
                connection_error: connection.connection_error_detected,
            };

            let restart_delay = if self.inner.policy.should_restart(&exit) {
                // Delay comes from the attempts made so far
                let delay = self.inner.policy.calculate_delay(&state.restart);
                state.restart.record_restart();
                state.run_state = RunState::ReconnectPending {
                    attempt: state.restart.attempts(),
                };
                Some(delay)
            } else if exit.intended_running && !manual {
                state.run_state = RunState::CrashedNeedsManualRestart { exit_code };
                None
            } else {
                state.run_state = RunState::Stopped;
                None
            };

            (exit_code, manual, restart_delay)
        };

        let message = match exit_code {
            Some(code) => format!("Process exited with code {}", code),
            None => "Process was terminated by a signal".to_string(),
        };
        info!("Analysis {}: {}", self.inner.analysis_id, message);
        self.add_log(message).await;

        if manual {
            self.inner.monitor.reset_connection_state();
        }

        self.broadcast_status();
        self.save_config().await;

        match restart_delay {
            Some(delay) => self.schedule_restart(delay).await,
            None if !manual && self.intended_state() == ProcessStatus::Running => {
                warn!(
                    "Analysis {} exited without a connection error, not restarting",
                    self.inner.analysis_id
                );
            }
            None => {}
        }
    }

    async fn schedule_restart(&self, delay: Duration) {
        let attempt = self.restart_attempts();
        info!(
            "Restarting analysis {} in {:?} (attempt {})",
            self.inner.analysis_id, delay, attempt
        );
        self.add_log(format!(
            "Connection error detected, restarting in {} ms (attempt {})",
            delay.as_millis(),
            attempt
        ))
        .await;

        let mut state = self.inner.state();
        if !matches!(state.run_state, RunState::ReconnectPending { .. }) {
            // Stopped while the log line was written
            return;
        }

        // The timer only takes its own handle after the lock is released
        let supervisor = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let still_wanted = {
                let mut state = supervisor.inner.state();
                state.pending_restart.take();
                matches!(state.run_state, RunState::ReconnectPending { .. })
                    && state.handle.is_none()
            };
            if !still_wanted {
                debug!(
                    "Restart of analysis {} no longer wanted",
                    supervisor.inner.analysis_id
                );
                return;
            }

            if let Err(e) = supervisor.start_boxed().await {
                error!(
                    "Scheduled restart of analysis {} failed: {}",
                    supervisor.inner.analysis_id, e
                );
            }
        });

        if let Some(previous) = state.pending_restart.replace(task) {
            previous.abort();
        }
    }

    /// Stop the analysis, escalating to SIGKILL when it does not exit in time
    ///
    /// Without a live process this only withdraws a pending restart or crash
    /// state, and does not persist anything.
    pub async fn stop(&self) -> Result<()> {
        let live = {
            let mut state = self.inner.state();
            if let Some(pending) = state.pending_restart.take() {
                pending.abort();
            }
            state.start_epoch += 1;
            state.is_starting = false;

            match state.handle.as_ref() {
                Some(handle) => {
                    let live = (handle.pid, handle.signals.clone(), handle.exited.clone());
                    state.is_manual_stop = true;
                    state.run_state = RunState::Stopping;
                    Some(live)
                }
                None => {
                    if state.run_state != RunState::Stopped {
                        debug!(
                            "Analysis {} is {}, clearing it",
                            self.inner.analysis_id, state.run_state
                        );
                        state.run_state = RunState::Stopped;
                    }
                    None
                }
            }
        };

        let Some((pid, signals, mut exited)) = live else {
            self.broadcast_status();
            return Ok(());
        };

        self.inner.monitor.reset_connection_state();
        self.broadcast_status();

        info!("Stopping analysis {} (pid {})", self.inner.analysis_id, pid);
        if signals.send(Signal::SIGTERM).is_err() {
            debug!("Analysis {} already exited", self.inner.analysis_id);
        }

        let timeout = self.inner.config.force_kill_timeout();
        if tokio::time::timeout(timeout, wait_for_exit(&mut exited))
            .await
            .is_err()
        {
            warn!(
                "Analysis {} did not exit within {:?}, sending SIGKILL",
                self.inner.analysis_id, timeout
            );
            self.add_log("Process did not exit in time, force killing")
                .await;
            let _ = signals.send(Signal::SIGKILL);
            wait_for_exit(&mut exited).await;
        }

        Ok(())
    }

    /// Apply an externally decided status
    ///
    /// Marking a running process as stopped keeps the wish to run it, so it
    /// reads as a crash rather than a deliberate stop.
    pub fn update_status(&self, status: ProcessStatus, enabled: bool) {
        {
            let mut state = self.inner.state();
            state.enabled = enabled;
            state.run_state = match (status, state.run_state) {
                (ProcessStatus::Running, RunState::Stopping) => RunState::Stopping,
                (ProcessStatus::Running, _) => RunState::Running,
                (ProcessStatus::Stopped, RunState::Running) => {
                    RunState::CrashedNeedsManualRestart {
                        exit_code: state.exit_code,
                    }
                }
                (ProcessStatus::Stopped, RunState::Stopping) => RunState::Stopped,
                (ProcessStatus::Stopped, current) => current,
            };
        }
        self.broadcast_status();
    }

    /// Tear everything down without waiting. Never fails.
    pub async fn cleanup(&self) {
        let handle = {
            let mut state = self.inner.state();
            if let Some(pending) = state.pending_restart.take() {
                pending.abort();
            }
            state.start_epoch += 1;
            state.is_starting = false;
            state.is_manual_stop = false;
            state.run_state = RunState::Stopped;
            state.enabled = false;
            state.handle.take()
        };

        if let Some(handle) = handle {
            debug!(
                "Killing analysis {} (pid {}) during cleanup",
                self.inner.analysis_id, handle.pid
            );
            if !handle.signal(Signal::SIGKILL) {
                debug!("Analysis {} already exited", self.inner.analysis_id);
            }
        }

        self.inner.monitor.reset_connection_state();
        self.inner.logs.lock().await.reset();
        self.broadcast_status();
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.state().run_state.status()
    }

    pub fn intended_state(&self) -> ProcessStatus {
        self.inner.state().run_state.intended_state()
    }

    pub fn run_state(&self) -> RunState {
        self.inner.state().run_state
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.state().pid()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.state().exit_code
    }

    pub fn restart_attempts(&self) -> u32 {
        self.inner.state().restart.attempts()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        self.inner
            .state()
            .snapshot(&self.inner.analysis_id, &self.inner.analysis_name)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.monitor.connection_status()
    }

    /// Page through the in-memory log buffer, newest first
    pub async fn memory_logs(&self, page: usize, limit: usize) -> LogPage {
        self.inner.logs.lock().await.get_memory_logs(page, limit)
    }

    pub async fn log_stats(&self) -> LogStats {
        self.inner.logs.lock().await.stats()
    }

    pub async fn clear_logs(&self) -> Result<()> {
        self.inner.logs.lock().await.clear_logs().await
    }

    /// Record a line in the analysis log
    pub async fn add_log(&self, message: impl Into<String>) {
        self.inner.logs.lock().await.add_log(message).await;
    }

    fn broadcast_status(&self) {
        let event = {
            let state = self.inner.state();
            SupervisorEvent::Status {
                analysis_id: self.inner.analysis_id.clone(),
                analysis_name: self.inner.analysis_name.clone(),
                status: state.run_state.status(),
                intended_state: state.run_state.intended_state(),
                enabled: state.enabled,
                exit_code: state.exit_code,
            }
        };
        self.inner.events.broadcast(event);
    }

    async fn save_config(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.inner.service.save_config(&snapshot).await {
            warn!(
                "Failed to save state of analysis {}: {}",
                self.inner.analysis_id, e
            );
        }
    }
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    // An error means the watcher is gone, which also means the exit was handled
    let _ = exited.wait_for(|done| *done).await;
}
