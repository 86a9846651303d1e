use crate::config::MarkerConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest fragment kept while waiting for a newline
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines
///
/// Bytes after the last newline are kept until the next chunk arrives, so a
/// line split across two reads is still logged as one line. A fragment that
/// reaches [`MAX_LINE_BYTES`] without a newline is emitted as a line of its
/// own.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for part in chunk.split_inclusive(|b| *b == b'\n') {
            let (body, complete) = match part.split_last() {
                Some((b'\n', body)) => (body, true),
                _ => (part, false),
            };

            let mut body = body;
            while self.pending.len() + body.len() >= MAX_LINE_BYTES {
                let take = MAX_LINE_BYTES - self.pending.len();
                self.pending.extend_from_slice(&body[..take]);
                body = &body[take..];
                let raw = std::mem::take(&mut self.pending);
                lines.extend(clean_line(&raw));
            }
            self.pending.extend_from_slice(body);

            if complete {
                let raw = std::mem::take(&mut self.pending);
                lines.extend(clean_line(&raw));
            }
        }

        lines
    }

    /// Return the unterminated tail once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        clean_line(&rest)
    }
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end();
    if line.trim_start().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// What an output line says about the analysis' platform connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection established
    Connected,
    /// Connection lost, the analysis is retrying on its own
    Reconnecting,
    /// The platform rejected the analysis; retrying in-process is pointless
    Fatal,
}

/// Maps a line of output to a connection event
pub trait LineClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Option<ConnectionEvent>;
}

/// Classifier matching configured marker phrases, case-insensitively
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    connected: Vec<String>,
    reconnecting: Vec<String>,
    fatal: Vec<String>,
}

impl MarkerClassifier {
    pub fn new(markers: &MarkerConfig) -> Self {
        let lower = |phrases: &[String]| -> Vec<String> {
            phrases
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.to_lowercase())
                .collect()
        };

        Self {
            connected: lower(&markers.connected),
            reconnecting: lower(&markers.reconnecting),
            fatal: lower(&markers.fatal),
        }
    }
}

impl LineClassifier for MarkerClassifier {
    fn classify(&self, line: &str) -> Option<ConnectionEvent> {
        let line = line.to_lowercase();
        let matches = |phrases: &[String]| phrases.iter().any(|p| line.contains(p.as_str()));

        // Fatal wins when a line matches several groups
        if matches(&self.fatal) {
            Some(ConnectionEvent::Fatal)
        } else if matches(&self.reconnecting) {
            Some(ConnectionEvent::Reconnecting)
        } else if matches(&self.connected) {
            Some(ConnectionEvent::Connected)
        } else {
            None
        }
    }
}

/// Something that can terminate the monitored process
pub trait Terminate: Send + Sync + 'static {
    fn terminate(&self, reason: &str);
}

/// Snapshot of the connection tracking state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub reconnection_attempts: u32,
    pub connection_error_detected: bool,
    pub grace_timer_active: bool,
}

#[derive(Debug, Default)]
struct ConnectionState {
    is_connected: bool,
    reconnection_attempts: u32,
    connection_error_detected: bool,
    grace_timer_active: bool,
    /// Bumped whenever a grace timer is started or cancelled
    grace_episode: u64,
    grace_timer: Option<JoinHandle<()>>,
}

impl ConnectionState {
    fn cancel_grace_timer(&mut self) {
        self.grace_episode += 1;
        self.grace_timer_active = false;
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

/// Watches analysis output for connection markers
///
/// A soft disconnect gives the analysis a grace period to reconnect on its
/// own; if it does not, the process is terminated and the exit is flagged as
/// a connection error. A fatal marker terminates immediately.
pub struct OutputMonitor {
    analysis_id: String,
    classifier: Box<dyn LineClassifier>,
    grace_period: Duration,
    state: Arc<Mutex<ConnectionState>>,
}

impl OutputMonitor {
    pub fn new(
        analysis_id: impl Into<String>,
        classifier: Box<dyn LineClassifier>,
        grace_period: Duration,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            classifier,
            grace_period,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    /// Inspect one line of output and react to any marker in it
    pub fn handle_line(
        &self,
        line: &str,
        terminator: Arc<dyn Terminate>,
    ) -> Option<ConnectionEvent> {
        let event = self.classifier.classify(line)?;

        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Reconnecting => self.on_reconnecting(terminator),
            ConnectionEvent::Fatal => self.on_fatal(terminator),
        }

        Some(event)
    }

    fn on_connected(&self) {
        let mut state = self.state();
        if state.grace_timer_active {
            info!(
                "Analysis {} reconnected within the grace period",
                self.analysis_id
            );
        }
        state.cancel_grace_timer();
        state.is_connected = true;
        state.reconnection_attempts = 0;
        state.connection_error_detected = false;
    }

    fn on_reconnecting(&self, terminator: Arc<dyn Terminate>) {
        let episode = {
            let mut state = self.state();
            state.is_connected = false;
            state.reconnection_attempts += 1;
            debug!(
                "Analysis {} lost its connection (attempt {})",
                self.analysis_id, state.reconnection_attempts
            );

            if state.grace_timer_active {
                return;
            }
            state.grace_episode += 1;
            state.grace_timer_active = true;
            state.grace_episode
        };

        let shared = Arc::clone(&self.state);
        let grace_period = self.grace_period;
        let analysis_id = self.analysis_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;

            let expired = {
                let mut state = lock(&shared);
                if state.grace_episode == episode && state.grace_timer_active {
                    state.grace_timer_active = false;
                    state.grace_timer = None;
                    state.connection_error_detected = true;
                    true
                } else {
                    false
                }
            };

            if expired {
                warn!(
                    "Analysis {} did not reconnect within {:?}, terminating",
                    analysis_id, grace_period
                );
                terminator.terminate("connection not restored within grace period");
            }
        });

        let mut state = self.state();
        if state.grace_episode == episode && state.grace_timer_active {
            state.grace_timer = Some(timer);
        }
    }

    fn on_fatal(&self, terminator: Arc<dyn Terminate>) {
        {
            let mut state = self.state();
            state.cancel_grace_timer();
            state.is_connected = false;
            state.connection_error_detected = true;
        }

        warn!(
            "Analysis {} reported a fatal connection error, terminating",
            self.analysis_id
        );
        terminator.terminate("fatal connection error");
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.state();
        ConnectionStatus {
            is_connected: state.is_connected,
            reconnection_attempts: state.reconnection_attempts,
            connection_error_detected: state.connection_error_detected,
            grace_timer_active: state.grace_timer_active,
        }
    }

    /// Forget everything about the previous run and cancel a pending grace timer
    pub fn reset_connection_state(&self) {
        let mut state = self.state();
        state.cancel_grace_timer();
        state.is_connected = false;
        state.reconnection_attempts = 0;
        state.connection_error_detected = false;
    }
}

impl Drop for OutputMonitor {
    fn drop(&mut self) {
        self.state().cancel_grace_timer();
    }
}

fn lock(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
