// Output formatting and display for CLI

use crate::config::DaemonConfig;
use crate::logs::LogPage;
use crate::process::{ProcessSnapshot, RunState};
use crate::state::SupervisorState;
use chrono::{DateTime, Local, Utc};
use colored::*;
use std::path::Path;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print the persisted state of every configured analysis
pub fn print_status_table(config: &DaemonConfig, state: &SupervisorState) {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "Intended")]
        intended: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Exit")]
        exit_code: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last Start")]
        last_start: String,
    }

    if config.analyses.is_empty() {
        println!("{}", "No analyses are configured".yellow());
        return;
    }

    let rows: Vec<StatusRow> = config
        .analyses
        .iter()
        .map(|analysis| match state.get(&analysis.id) {
            Some(snapshot) => status_row(snapshot),
            None => StatusRow {
                id: analysis.id.clone(),
                name: truncate(analysis.display_name(), 20),
                state: "never run".bright_black().to_string(),
                intended: "-".to_string(),
                pid: "-".to_string(),
                exit_code: "-".to_string(),
                restarts: "0".to_string(),
                last_start: "-".to_string(),
            },
        })
        .collect();

    fn status_row(snapshot: &ProcessSnapshot) -> StatusRow {
        StatusRow {
            id: snapshot.analysis_id.clone(),
            name: truncate(&snapshot.analysis_name, 20),
            state: format_run_state_colored(&snapshot.run_state),
            intended: snapshot.intended_state.to_string(),
            pid: optional(snapshot.pid),
            exit_code: optional(snapshot.exit_code),
            restarts: snapshot.restart_attempts.to_string(),
            last_start: snapshot
                .last_start_time
                .map(format_time)
                .unwrap_or_else(|| "-".to_string()),
        }
    }

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!(
            "Total: {} analysis(es), state saved {}",
            config.analyses.len(),
            format_time(state.last_updated)
        )
        .dimmed()
        .italic()
    );
}

/// Print one page of log entries, oldest first
pub fn print_log_page(analysis_id: &str, page: usize, log_page: &LogPage) {
    if log_page.logs.is_empty() {
        println!("{}", format!("No logs available for {}", analysis_id).yellow());
        return;
    }

    println!("\n{}", format!("Logs of {}", analysis_id).bold().underline());
    println!();

    for entry in log_page.logs.iter().rev() {
        println!("{}", entry.format());
    }

    println!();
    let mut footer = format!(
        "Page {} - {} entries shown, {} total",
        page.max(1),
        log_page.logs.len(),
        log_page.total_count
    );
    if log_page.has_more {
        footer.push_str(&format!(" (next: --page {})", page.max(1) + 1));
    }
    println!("{}", footer.dimmed().italic());
}

/// Print the outcome of a configuration check
pub fn print_config_summary(path: &Path, config: &DaemonConfig) {
    #[derive(Tabled)]
    struct AnalysisRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Enabled")]
        enabled: String,
        #[tabled(rename = "Script")]
        script: String,
    }

    println!(
        "{} {}",
        "✓".green().bold(),
        format!("{} is valid", path.display())
    );
    println!(
        "  {:<15} {}",
        "Runtime:".bold(),
        config.supervisor.runtime.display()
    );
    println!(
        "  {:<15} {}",
        "Sandbox:".bold(),
        if config.supervisor.sandbox.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        }
    );
    println!(
        "  {:<15} {}",
        "State file:".bold(),
        config.state_path.display()
    );

    let rows: Vec<AnalysisRow> = config
        .analyses
        .iter()
        .map(|analysis| {
            let script = config.supervisor.script_path(&analysis.id);
            AnalysisRow {
                id: analysis.id.clone(),
                name: truncate(analysis.display_name(), 20),
                enabled: if analysis.enabled { "yes" } else { "no" }.to_string(),
                script: if script.exists() {
                    script.display().to_string()
                } else {
                    format!("{} (missing)", script.display()).red().to_string()
                },
            }
        })
        .collect();

    if rows.is_empty() {
        println!("\n{}", "No analyses are configured".yellow());
        return;
    }

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    println!("\n{}\n", table);
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

fn format_run_state_colored(state: &RunState) -> String {
    match state {
        RunState::Running => state.to_string().green().to_string(),
        RunState::Stopping | RunState::ReconnectPending { .. } => {
            state.to_string().yellow().to_string()
        }
        RunState::Stopped => state.to_string().bright_black().to_string(),
        RunState::CrashedNeedsManualRestart { .. } => state.to_string().red().bold().to_string(),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a very long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_optional() {
        assert_eq!(optional(Some(42)), "42");
        assert_eq!(optional::<u32>(None), "-");
    }
}
