// Daemon module - runs every configured analysis under its own supervisor

mod health;

pub use health::HealthReport;

use crate::config::DaemonConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{ChannelBroadcaster, EventSink, SupervisorEvent};
use crate::ipc::{CachingResolver, DnsResolver};
use crate::process::ProcessSupervisor;
use crate::state::{LocalService, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Owns the supervisors and the collaborators they share
pub struct Daemon {
    config: DaemonConfig,
    service: Arc<LocalService>,
    events: ChannelBroadcaster,
    supervisors: Vec<ProcessSupervisor>,
}

impl Daemon {
    /// Build one supervisor per configured analysis
    ///
    /// All supervisors share a single DNS cache and event channel.
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let store = StateStore::new(&config.state_path);
        let service = Arc::new(LocalService::new(&config.analyses, store)?);
        let resolver: Arc<dyn DnsResolver> =
            Arc::new(CachingResolver::new(config.supervisor.dns_cache_ttl()));
        let events = ChannelBroadcaster::new();
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());

        let mut supervisors = Vec::with_capacity(config.analyses.len());
        for analysis in &config.analyses {
            let supervisor = ProcessSupervisor::new(
                analysis.id.clone(),
                analysis.display_name(),
                config.supervisor.clone(),
                service.clone(),
                Arc::clone(&resolver),
                Arc::clone(&sink),
            );

            if let Err(e) = supervisor.initialize_log_state().await {
                warn!(
                    "Failed to load log history of analysis {}: {}",
                    analysis.id, e
                );
            }
            supervisors.push(supervisor);
        }

        Ok(Self {
            config,
            service,
            events,
            supervisors,
        })
    }

    pub fn supervisors(&self) -> &[ProcessSupervisor] {
        &self.supervisors
    }

    pub fn supervisor(&self, analysis_id: &str) -> Option<&ProcessSupervisor> {
        self.supervisors
            .iter()
            .find(|s| s.analysis_id() == analysis_id)
    }

    /// Subscribe to the events of every supervisor
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start every analysis that is enabled in the configuration or was
    /// enabled when the previous run shut down. Returns how many started.
    pub async fn start_analyses(&self) -> usize {
        let persisted = self.service.state().await;
        let mut started = 0;

        for analysis in &self.config.analyses {
            if !analysis.enabled && !persisted.is_enabled(&analysis.id) {
                continue;
            }

            let Some(supervisor) = self.supervisor(&analysis.id) else {
                continue;
            };

            match supervisor.start().await {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start analysis {}: {}", analysis.id, e),
            }
        }

        info!(
            "Started {} of {} configured analyses",
            started,
            self.config.analyses.len()
        );
        started
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport::collect(&self.supervisors)
    }

    /// Stop every running analysis
    ///
    /// The enabled flag survives, so the next run starts the same set again.
    pub async fn shutdown(&self) {
        info!("Stopping {} supervisor(s)", self.supervisors.len());

        let mut stops = JoinSet::new();
        for supervisor in &self.supervisors {
            let supervisor = supervisor.clone();
            stops.spawn(async move {
                if let Err(e) = supervisor.stop().await {
                    error!(
                        "Failed to stop analysis {}: {}",
                        supervisor.analysis_id(),
                        e
                    );
                }
            });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                error!("Stop task failed: {}", e);
            }
        }

        info!("All analyses stopped");
    }

    /// Run until SIGTERM or SIGINT, then stop everything
    pub async fn run(self) -> Result<()> {
        self.start_analyses().await;

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| SupervisorError::SignalError(format!("SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| SupervisorError::SignalError(format!("SIGINT handler: {}", e)))?;

        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.health_check_interval_secs.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = interval.tick() => self.log_health(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn log_health(&self) {
        let report = self.health_report();

        if !report.crashed.is_empty() {
            warn!(
                "Analyses waiting for a manual restart: {}",
                report.crashed.join(", ")
            );
        }
        if !report.reconnecting.is_empty() {
            info!(
                "Analyses waiting to reconnect: {}",
                report.reconnecting.join(", ")
            );
        }
        info!(
            "Health: {} running, {} stopped, {} reconnecting, {} crashed",
            report.running,
            report.stopped,
            report.reconnecting.len(),
            report.crashed.len()
        );
    }
}
