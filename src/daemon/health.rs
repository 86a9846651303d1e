use crate::process::{ProcessSupervisor, RunState};

/// Point-in-time summary of all supervised analyses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub running: usize,
    pub stopped: usize,
    /// Waiting for a scheduled restart after a connection failure
    pub reconnecting: Vec<String>,
    /// Exited on their own and need a manual restart
    pub crashed: Vec<String>,
}

impl HealthReport {
    pub fn collect(supervisors: &[ProcessSupervisor]) -> Self {
        let mut report = Self::default();

        for supervisor in supervisors {
            match supervisor.run_state() {
                RunState::Running | RunState::Stopping => report.running += 1,
                RunState::Stopped => report.stopped += 1,
                RunState::ReconnectPending { .. } => {
                    report.reconnecting.push(supervisor.analysis_id().to_string())
                }
                RunState::CrashedNeedsManualRestart { .. } => {
                    report.crashed.push(supervisor.analysis_id().to_string())
                }
            }
        }

        report
    }

    pub fn is_healthy(&self) -> bool {
        self.crashed.is_empty()
    }
}
