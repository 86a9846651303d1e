use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: where state lives, how supervisors behave, and which
/// analyses to host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the persisted supervisor state file
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// How often the daemon reports on analyses that should be running (in seconds)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Settings shared by every supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Analyses hosted by this daemon
    #[serde(default)]
    pub analyses: Vec<AnalysisConfig>,
}

/// One hosted analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Analysis identifier (also the directory name under `analyses_dir`)
    pub id: String,

    /// Human-readable name, defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    /// Whether the analysis should be started when the daemon boots
    #[serde(default)]
    pub enabled: bool,

    /// Environment variables handed to the analysis
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AnalysisConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Per-supervisor tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root directory holding one sub-directory per analysis
    pub analyses_dir: PathBuf,

    /// Runtime used to execute analysis scripts
    pub runtime: PathBuf,

    /// Script file name inside each analysis directory
    pub entry_file: String,

    /// Number of log lines kept in memory per analysis
    pub max_memory_logs: usize,

    /// Hard cap of the on-disk log file (in bytes)
    pub max_log_file_size: u64,

    /// Delay between SIGTERM and SIGKILL on stop (in milliseconds)
    pub force_kill_timeout_ms: u64,

    /// How long a reconnecting analysis may stay disconnected (in milliseconds)
    pub connection_grace_period_ms: u64,

    /// Lifetime of cached DNS answers (in seconds)
    pub dns_cache_ttl_secs: u64,

    pub restart: RestartConfig,

    pub sandbox: SandboxConfig,

    pub markers: MarkerConfig,
}

/// Backoff settings for connection-error restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Delay before the first restart (in milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for the backoff delay (in milliseconds)
    pub max_delay_ms: u64,
}

/// Runtime permission sandbox applied to analysis processes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Extra read-only paths (utility libraries) besides the script and runtime
    pub read_paths: Vec<PathBuf>,
    pub allow_child_process: bool,
    pub allow_worker_threads: bool,
}

/// Output phrases that drive the connection state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub connected: Vec<String>,
    pub reconnecting: Vec<String>,
    pub fatal: Vec<String>,
}

// Default value functions for serde
fn default_state_path() -> PathBuf {
    PathBuf::from("data/supervisor_state.json")
}

fn default_health_check_interval() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            analyses_dir: PathBuf::from("analyses"),
            runtime: PathBuf::from("node"),
            entry_file: "index.js".to_string(),
            max_memory_logs: 1000,
            max_log_file_size: 50 * 1024 * 1024,
            force_kill_timeout_ms: 5_000,
            connection_grace_period_ms: 30_000,
            dns_cache_ttl_secs: 300,
            restart: RestartConfig::default(),
            sandbox: SandboxConfig::default(),
            markers: MarkerConfig::default(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            connected: vec![
                "Connected to TagoIO".to_string(),
                "Waiting for analysis trigger".to_string(),
            ],
            reconnecting: vec![
                "closed, reconnecting".to_string(),
                "trying to reconnect".to_string(),
            ],
            fatal: vec![
                "Analysis not found or not active".to_string(),
                "Invalid analysis token".to_string(),
                "Authorization denied".to_string(),
            ],
        }
    }
}

impl SupervisorConfig {
    /// Validate the supervisor settings
    pub fn validate(&self) -> Result<()> {
        if self.runtime.as_os_str().is_empty() {
            return Err(SupervisorError::MissingConfigField("runtime".to_string()));
        }

        if self.entry_file.is_empty() {
            return Err(SupervisorError::MissingConfigField("entry_file".to_string()));
        }

        if self.max_memory_logs == 0 {
            return Err(SupervisorError::ConfigValidationError(
                "max_memory_logs must be at least 1".to_string(),
            ));
        }

        if self.max_log_file_size == 0 {
            return Err(SupervisorError::ConfigValidationError(
                "max_log_file_size must be greater than 0".to_string(),
            ));
        }

        if self.restart.initial_delay_ms == 0 {
            return Err(SupervisorError::ConfigValidationError(
                "restart.initial_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.restart.max_delay_ms < self.restart.initial_delay_ms {
            return Err(SupervisorError::ConfigValidationError(format!(
                "restart.max_delay_ms ({}) cannot be lower than restart.initial_delay_ms ({})",
                self.restart.max_delay_ms, self.restart.initial_delay_ms
            )));
        }

        Ok(())
    }

    /// Directory of one analysis
    pub fn analysis_dir(&self, analysis_id: &str) -> PathBuf {
        self.analyses_dir.join(analysis_id)
    }

    /// Script executed for an analysis
    pub fn script_path(&self, analysis_id: &str) -> PathBuf {
        self.analysis_dir(analysis_id).join(&self.entry_file)
    }

    /// On-disk log file of an analysis
    pub fn log_path(&self, analysis_id: &str) -> PathBuf {
        self.analysis_dir(analysis_id).join("logs").join("analysis.log")
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.connection_grace_period_ms)
    }

    pub fn dns_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_cache_ttl_secs)
    }
}

impl DaemonConfig {
    /// Load the daemon configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<DaemonConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        // Determine format based on file extension
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(SupervisorError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<DaemonConfig> {
        toml::from_str(contents)
            .map_err(|e| SupervisorError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<DaemonConfig> {
        serde_json::from_str(contents)
            .map_err(|e| SupervisorError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()?;

        if self.health_check_interval_secs == 0 {
            return Err(SupervisorError::ConfigValidationError(
                "health_check_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for analysis in &self.analyses {
            if analysis.id.is_empty() {
                return Err(SupervisorError::MissingConfigField("analyses.id".to_string()));
            }
            if analysis.id.contains('/') || analysis.id.contains("..") {
                return Err(SupervisorError::ConfigValidationError(format!(
                    "Analysis id must be a plain directory name: {}",
                    analysis.id
                )));
            }
            if !seen.insert(analysis.id.as_str()) {
                return Err(SupervisorError::ConfigValidationError(format!(
                    "Duplicate analysis id: {}",
                    analysis.id
                )));
            }
        }

        Ok(())
    }

    pub fn find_analysis(&self, analysis_id: &str) -> Option<&AnalysisConfig> {
        self.analyses.iter().find(|a| a.id == analysis_id)
    }

    /// Expand environment variables in paths and analysis env values
    fn expand_env_vars(&mut self) {
        self.state_path = expand_env_in_path(&self.state_path);
        self.supervisor.analyses_dir = expand_env_in_path(&self.supervisor.analyses_dir);
        self.supervisor.runtime = expand_env_in_path(&self.supervisor.runtime);
        self.supervisor.sandbox.read_paths = self
            .supervisor
            .sandbox
            .read_paths
            .iter()
            .map(|p| expand_env_in_path(p))
            .collect();

        for analysis in &mut self.analyses {
            analysis.env = analysis
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
                .collect();
        }
    }
}

/// Expand `${VAR}` and `$VAR` references in a string
fn expand_env_in_string(s: &str) -> String {
    let mut result = s.to_string();

    for (key, value) in std::env::vars() {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }

    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_env_in_string(&path_str))
}
