// State module - Persistent storage for supervisor snapshots

use crate::config::AnalysisConfig;
use crate::error::{Result, SupervisorError};
use crate::process::ProcessSnapshot;
use crate::service::AnalysisService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

/// Everything persisted between daemon runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorState {
    pub version: String,
    pub analyses: Vec<ProcessSnapshot>,
    pub last_updated: DateTime<Utc>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            analyses: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Validate the state structure
    pub fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(SupervisorError::StateCorruption(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        let mut seen = HashSet::new();
        for snapshot in &self.analyses {
            if !seen.insert(snapshot.analysis_id.as_str()) {
                return Err(SupervisorError::StateCorruption(format!(
                    "Duplicate analysis ID found: {}",
                    snapshot.analysis_id
                )));
            }
        }

        Ok(())
    }

    pub fn get(&self, analysis_id: &str) -> Option<&ProcessSnapshot> {
        self.analyses.iter().find(|s| s.analysis_id == analysis_id)
    }

    /// Insert or replace the snapshot of one analysis
    pub fn upsert(&mut self, snapshot: ProcessSnapshot) {
        match self
            .analyses
            .iter_mut()
            .find(|s| s.analysis_id == snapshot.analysis_id)
        {
            Some(existing) => *existing = snapshot,
            None => self.analyses.push(snapshot),
        }
        self.last_updated = Utc::now();
    }

    /// Whether the analysis was enabled when last persisted
    pub fn is_enabled(&self, analysis_id: &str) -> bool {
        self.get(analysis_id).map(|s| s.enabled).unwrap_or(false)
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

/// State store handles persistence of supervisor state to disk
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from disk. A missing file is an empty state.
    pub fn load(&self) -> Result<SupervisorState> {
        if !self.path.exists() {
            return Ok(SupervisorState::new());
        }

        let file = File::open(&self.path).map_err(|e| {
            SupervisorError::StateLoadError(format!("Failed to open state file: {}", e))
        })?;

        let state: SupervisorState =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                SupervisorError::StateLoadError(format!("Failed to parse state file: {}", e))
            })?;

        state.validate()?;

        Ok(state)
    }

    /// Save state to disk with atomic writes
    pub fn save(&self, state: &SupervisorState) -> Result<()> {
        state.validate()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                SupervisorError::StateSaveError(format!(
                    "Failed to create state directory: {}",
                    e
                ))
            })?;
        }

        // Write to a temporary file first, then rename over the real one
        let temp_path = self.path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                SupervisorError::StateSaveError(format!(
                    "Failed to create temp state file: {}",
                    e
                ))
            })?;

            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state).map_err(|e| {
                SupervisorError::StateSaveError(format!("Failed to serialize state: {}", e))
            })?;
            writer.flush().map_err(|e| {
                SupervisorError::StateSaveError(format!("Failed to flush state file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            SupervisorError::StateSaveError(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Analysis service backed by the daemon configuration and a state file
///
/// Environments come from the `env` tables of the configured analyses.
/// Snapshots are merged into one JSON document on disk.
pub struct LocalService {
    environments: HashMap<String, HashMap<String, String>>,
    store: StateStore,
    state: Mutex<SupervisorState>,
}

impl LocalService {
    /// Build the service, loading whatever state a previous run left behind
    pub fn new(analyses: &[AnalysisConfig], store: StateStore) -> Result<Self> {
        let state = store.load()?;
        debug!(
            "Loaded {} persisted analysis snapshot(s) from {}",
            state.analyses.len(),
            store.path().display()
        );

        let environments = analyses
            .iter()
            .map(|a| (a.id.clone(), a.env.clone()))
            .collect();

        Ok(Self {
            environments,
            store,
            state: Mutex::new(state),
        })
    }

    /// Copy of the current persisted state
    pub async fn state(&self) -> SupervisorState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl AnalysisService for LocalService {
    async fn get_environment(&self, analysis_id: &str) -> Result<HashMap<String, String>> {
        self.environments
            .get(analysis_id)
            .cloned()
            .ok_or_else(|| SupervisorError::AnalysisNotFound(analysis_id.to_string()))
    }

    async fn save_config(&self, snapshot: &ProcessSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        state.upsert(snapshot.clone());

        let store = self.store.clone();
        let to_save = state.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save))
            .await
            .map_err(|e| SupervisorError::StateSaveError(format!("Save task failed: {}", e)))?
    }
}
