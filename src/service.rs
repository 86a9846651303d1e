// Collaborators the supervisor depends on but does not own

use crate::error::Result;
use crate::process::ProcessSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;

/// Host service providing analysis environments and durable storage
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Environment variables for an analysis, by name
    async fn get_environment(&self, analysis_id: &str) -> Result<HashMap<String, String>>;

    /// Persist supervisor-visible state
    async fn save_config(&self, snapshot: &ProcessSnapshot) -> Result<()>;
}
