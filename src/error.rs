use thiserror::Error;

/// Main error type for the analysis supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    // Process-related errors
    #[error("Analysis script not found: {0}")]
    ScriptNotFound(String),

    #[error("Failed to launch analysis {0}: {1}")]
    LaunchError(String, String),

    #[error("Analysis not found: {0}")]
    AnalysisNotFound(String),

    // IPC and DNS errors
    #[error("DNS resolution failed for {0}: {1}")]
    DnsError(String, String),

    #[error("IPC error: {0}")]
    IpcError(String),

    // State store errors
    #[error("Failed to load state: {0}")]
    StateLoadError(String),

    #[error("Failed to save state: {0}")]
    StateSaveError(String),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // System errors
    #[error("Signal error: {0}")]
    SignalError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
