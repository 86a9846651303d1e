// Process module - supervision of a single analysis process

pub mod monitor;
pub mod restart;
pub mod spawner;
mod supervisor;
mod types;

pub use monitor::{
    ConnectionEvent, ConnectionStatus, LineBuffer, LineClassifier, MarkerClassifier,
    OutputMonitor, Terminate,
};
pub use restart::{ExitContext, RestartPolicy, RestartTracker};
pub use spawner::{sandbox_flags, signal_process, spawn_analysis, LaunchSpec, SpawnedAnalysis};
pub use supervisor::ProcessSupervisor;
pub use types::{ProcessSnapshot, ProcessStatus, RunState};
