// CLI module - User-facing command-line interface

mod output;

pub use output::print_error;

use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::error::{Result, SupervisorError};
use crate::logs::{load_log_file, LogPage};
use crate::state::StateStore;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Supervisor for sandboxed analysis processes
#[derive(Parser)]
#[command(name = "analysis-supervisor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (TOML or JSON)
    #[arg(short, long, global = true, default_value = "supervisor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all configured analyses until interrupted
    Run,

    /// Show the last persisted state of every analysis
    Status,

    /// View the log of an analysis
    Logs {
        /// Analysis ID
        id: String,

        /// Page to show, starting at 1 (newest entries first)
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Entries per page
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Validate the configuration file and list the analyses it defines
    CheckConfig,
}

impl Cli {
    /// Execute the parsed command
    pub async fn execute(self) -> Result<()> {
        let config = DaemonConfig::from_file(&self.config)?;

        match self.command {
            Commands::Run => {
                let daemon = Daemon::new(config).await?;
                daemon.run().await
            }

            Commands::Status => {
                let state = StateStore::new(&config.state_path).load()?;
                output::print_status_table(&config, &state);
                Ok(())
            }

            Commands::Logs { id, page, limit } => {
                if config.find_analysis(&id).is_none() {
                    return Err(SupervisorError::AnalysisNotFound(id));
                }
                let path = config.supervisor.log_path(&id);
                let log_page = read_log_page(&path, page, limit).await?;
                output::print_log_page(&id, page, &log_page);
                Ok(())
            }

            Commands::CheckConfig => {
                output::print_config_summary(&self.config, &config);
                Ok(())
            }
        }
    }
}

/// Read one page of a log file without touching it
///
/// Unlike the live log manager this never truncates or deletes an oversized
/// file.
pub async fn read_log_page(path: &Path, page: usize, limit: usize) -> Result<LogPage> {
    let page = page.max(1);
    let offset = (page - 1).saturating_mul(limit);
    let loaded = load_log_file(path, offset.saturating_add(limit)).await?;

    let logs: Vec<_> = loaded
        .recent
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect();
    let has_more = (offset.saturating_add(logs.len()) as u64) < loaded.total_count;

    Ok(LogPage {
        logs,
        has_more,
        total_count: loaded.total_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogEntry;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_log(path: &Path, count: u64) {
        let lines: Vec<String> = (1..=count)
            .map(|sequence| {
                serde_json::to_string(&LogEntry {
                    sequence,
                    timestamp: Utc::now(),
                    message: format!("line {}", sequence),
                })
                .unwrap()
            })
            .collect();
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_cli_parses_logs_command() {
        let cli = Cli::try_parse_from([
            "analysis-supervisor",
            "--config",
            "custom.toml",
            "logs",
            "a1",
            "--page",
            "2",
            "--limit",
            "10",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Commands::Logs { id, page, limit } => {
                assert_eq!(id, "a1");
                assert_eq!(page, 2);
                assert_eq!(limit, 10);
            }
            _ => panic!("Expected logs command"),
        }
    }

    #[test]
    fn test_cli_default_config_path() {
        let cli = Cli::try_parse_from(["analysis-supervisor", "run"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("supervisor.toml"));
    }

    #[tokio::test]
    async fn test_read_log_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analysis.log");
        write_log(&path, 25);

        let first = read_log_page(&path, 1, 10).await.unwrap();
        assert_eq!(first.total_count, 25);
        assert_eq!(first.logs.len(), 10);
        assert_eq!(first.logs[0].message, "line 25");
        assert!(first.has_more);

        let last = read_log_page(&path, 3, 10).await.unwrap();
        assert_eq!(last.logs.len(), 5);
        assert_eq!(last.logs[4].message, "line 1");
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_read_log_page_missing_file() {
        let dir = TempDir::new().unwrap();
        let page = read_log_page(&dir.path().join("missing.log"), 1, 10)
            .await
            .unwrap();

        assert!(page.logs.is_empty());
        assert_eq!(page.total_count, 0);
        assert!(!page.has_more);
    }
}
