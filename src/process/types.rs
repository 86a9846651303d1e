use crate::ipc::IpcResponse;
use crate::process::restart::RestartTracker;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Coarse process status as seen by the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Running => write!(f, "running"),
        }
    }
}

/// Lifecycle state of a supervised analysis
///
/// Both the current status and the desired end state are derived from this
/// single value, so they can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RunState {
    /// Not running and not supposed to run
    Stopped,
    Running,
    /// Manual stop in progress, waiting for the process to exit
    Stopping,
    /// Exited after a connection failure, restart scheduled
    #[serde(rename_all = "camelCase")]
    ReconnectPending { attempt: u32 },
    /// Exited on its own while it should be running; needs a human
    #[serde(rename_all = "camelCase")]
    CrashedNeedsManualRestart { exit_code: Option<i32> },
}

impl RunState {
    pub fn status(&self) -> ProcessStatus {
        match self {
            RunState::Running | RunState::Stopping => ProcessStatus::Running,
            _ => ProcessStatus::Stopped,
        }
    }

    pub fn intended_state(&self) -> ProcessStatus {
        match self {
            RunState::Stopped | RunState::Stopping => ProcessStatus::Stopped,
            _ => ProcessStatus::Running,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::ReconnectPending { attempt } => {
                write!(f, "reconnect pending (attempt {})", attempt)
            }
            RunState::CrashedNeedsManualRestart { exit_code: Some(code) } => {
                write!(f, "crashed (exit code {})", code)
            }
            RunState::CrashedNeedsManualRestart { exit_code: None } => {
                write!(f, "crashed (killed by signal)")
            }
        }
    }
}

/// Serializable view of a supervisor, persisted through `save_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub analysis_id: String,
    pub analysis_name: String,
    pub status: ProcessStatus,
    pub intended_state: ProcessStatus,
    pub run_state: RunState,
    pub enabled: bool,
    pub pid: Option<u32>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart_attempts: u32,
}

/// The live child of a supervisor
///
/// The tokio `Child` itself is owned by the exit watcher task; this handle
/// carries what the supervisor needs to signal and talk to it. Signals go
/// through the watcher, which only delivers them while the child is unreaped,
/// so a recycled pid is never hit.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    /// Distinguishes successive children of the same supervisor
    pub generation: u64,
    pub pid: u32,
    pub ipc_tx: mpsc::UnboundedSender<IpcResponse>,
    pub signals: mpsc::UnboundedSender<Signal>,
    /// Flips to `true` once the exit has been fully handled
    pub exited: watch::Receiver<bool>,
}

impl ChildHandle {
    /// Queue a signal for the child. `false` once the child is gone.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

/// Mutable state of one supervisor
#[derive(Debug)]
pub(crate) struct ProcessState {
    pub run_state: RunState,
    pub enabled: bool,
    pub handle: Option<ChildHandle>,
    pub generation: u64,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart: RestartTracker,
    pub is_manual_stop: bool,
    pub is_starting: bool,
    /// Bumped by `stop()` and `cleanup()` to cancel a start in flight
    pub start_epoch: u64,
    pub pending_restart: Option<JoinHandle<()>>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self {
            run_state: RunState::Stopped,
            enabled: false,
            handle: None,
            generation: 0,
            last_start_time: None,
            last_stop_time: None,
            exit_code: None,
            restart: RestartTracker::new(),
            is_manual_stop: false,
            is_starting: false,
            start_epoch: 0,
            pending_restart: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    pub fn snapshot(&self, analysis_id: &str, analysis_name: &str) -> ProcessSnapshot {
        ProcessSnapshot {
            analysis_id: analysis_id.to_string(),
            analysis_name: analysis_name.to_string(),
            status: self.run_state.status(),
            intended_state: self.run_state.intended_state(),
            run_state: self.run_state,
            enabled: self.enabled,
            pid: self.pid(),
            last_start_time: self.last_start_time,
            last_stop_time: self.last_stop_time,
            exit_code: self.exit_code,
            restart_attempts: self.restart.attempts(),
        }
    }
}
