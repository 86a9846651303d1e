use crate::error::Result;
use crate::events::{EventSink, SupervisorEvent};
use crate::logs::reader::load_log_file;
use crate::logs::{LogEntry, LogFile};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One page of in-memory log entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    /// Entries of the requested page, newest first
    pub logs: Vec<LogEntry>,
    pub has_more: bool,
    /// Lifetime number of entries, not the buffer size
    pub total_count: u64,
}

/// Log counters of an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total_count: u64,
    pub memory_count: usize,
    pub log_file_size: u64,
}

/// LogManager keeps the recent log history of one analysis in memory and
/// mirrors every entry to an append-only file with a hard size cap
pub struct LogManager {
    analysis_id: String,
    /// Newest entry first
    logs: VecDeque<LogEntry>,
    max_memory_logs: usize,
    max_file_size: u64,
    sequence: u64,
    total_log_count: u64,
    file: LogFile,
    events: Arc<dyn EventSink>,
}

impl LogManager {
    /// Create a log manager. No filesystem access happens until
    /// [`LogManager::initialize_log_state`] or the first write.
    pub fn new<P: AsRef<Path>>(
        analysis_id: impl Into<String>,
        log_path: P,
        max_memory_logs: usize,
        max_file_size: u64,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            logs: VecDeque::with_capacity(max_memory_logs.min(1024)),
            max_memory_logs,
            max_file_size,
            sequence: 0,
            total_log_count: 0,
            file: LogFile::new(log_path),
            events,
        }
    }

    /// Seed the in-memory state from the file left by a previous run
    ///
    /// A missing file is a valid empty state. A file above the size cap is
    /// deleted wholesale and replaced by a single "cleared" entry.
    pub async fn initialize_log_state(&mut self) -> Result<()> {
        let size = match self.file.stat().await? {
            Some(size) => size,
            None => {
                debug!(
                    "No log file for analysis {}, starting empty",
                    self.analysis_id
                );
                return Ok(());
            }
        };

        if size > self.max_file_size {
            info!(
                "Log file of analysis {} is {} bytes (limit {}), deleting it",
                self.analysis_id, size, self.max_file_size
            );
            self.file.remove().await?;
            self.reset();
            let message = format!(
                "Log file exceeded {} MB limit and was cleared",
                self.max_file_size / (1024 * 1024)
            );
            self.add_log(message).await;
            return Ok(());
        }

        let loaded = load_log_file(self.file.path(), self.max_memory_logs).await?;
        self.total_log_count = loaded.total_count;
        self.sequence = loaded.last_sequence;
        self.logs = loaded.recent;

        debug!(
            "Loaded {} log entries for analysis {} ({} kept in memory)",
            self.total_log_count,
            self.analysis_id,
            self.logs.len()
        );

        Ok(())
    }

    /// Record a log line
    ///
    /// The entry always lands in memory. Failures writing the file are logged
    /// and do not propagate.
    pub async fn add_log(&mut self, message: impl Into<String>) -> LogEntry {
        let message = message.into();

        let projected = self.file.size() + self.line_len(&message);
        if self.file.size() > 0 && projected > self.max_file_size {
            self.truncate_file().await;
        }

        let entry = self.record(message).await;
        self.broadcast_entry(&entry);
        entry
    }

    /// Page through the in-memory buffer (pages start at 1)
    pub fn get_memory_logs(&self, page: usize, limit: usize) -> LogPage {
        let page = page.max(1);
        let offset = (page - 1).saturating_mul(limit);

        let logs: Vec<LogEntry> = self.logs.iter().skip(offset).take(limit).cloned().collect();
        let has_more = offset.saturating_add(logs.len()) < self.logs.len();

        LogPage {
            logs,
            has_more,
            total_count: self.total_log_count,
        }
    }

    /// Delete the log history on disk and in memory, leaving a marker entry
    pub async fn clear_logs(&mut self) -> Result<()> {
        self.file.remove().await?;
        self.reset();

        self.events.broadcast(SupervisorEvent::LogsCleared {
            analysis_id: self.analysis_id.clone(),
        });
        self.add_log("Log file cleared").await;

        Ok(())
    }

    /// Forget the in-memory state, leaving the file untouched
    pub fn reset(&mut self) {
        self.logs.clear();
        self.sequence = 0;
        self.total_log_count = 0;
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            total_count: self.total_log_count,
            memory_count: self.logs.len(),
            log_file_size: self.file.size(),
        }
    }

    pub fn total_log_count(&self) -> u64 {
        self.total_log_count
    }

    pub fn log_path(&self) -> &Path {
        self.file.path()
    }

    /// Size on disk of `message` as the next entry, newline included
    fn line_len(&self, message: &str) -> u64 {
        let entry = LogEntry {
            sequence: self.sequence + 1,
            timestamp: Utc::now(),
            message: message.to_string(),
        };
        match serde_json::to_string(&entry) {
            Ok(line) => line.len() as u64 + 1,
            Err(_) => message.len() as u64 + 1,
        }
    }

    async fn record(&mut self, message: String) -> LogEntry {
        self.sequence += 1;
        let mut entry = LogEntry {
            sequence: self.sequence,
            timestamp: Utc::now(),
            message,
        };

        let budget = self.max_file_size.saturating_sub(self.file.size());
        let line = fit_line(&mut entry, budget);

        self.logs.push_front(entry.clone());
        while self.logs.len() > self.max_memory_logs {
            self.logs.pop_back();
        }
        self.total_log_count += 1;

        match line {
            Some(line) => {
                if let Err(e) = self.file.append_line(&line).await {
                    warn!(
                        "Failed to persist log entry for analysis {}: {}",
                        self.analysis_id, e
                    );
                }
            }
            None => warn!(
                "Log entry {} of analysis {} does not fit in the log file, keeping it in memory only",
                entry.sequence, self.analysis_id
            ),
        }

        entry
    }

    async fn truncate_file(&mut self) {
        info!(
            "Log file of analysis {} reached {} bytes, truncating",
            self.analysis_id,
            self.file.size()
        );

        if let Err(e) = self.file.truncate().await {
            warn!(
                "Failed to truncate log file of analysis {}: {}",
                self.analysis_id, e
            );
            return;
        }

        let marker = self
            .record(format!(
                "Log file exceeded {} MB limit and was cleared",
                self.max_file_size / (1024 * 1024)
            ))
            .await;
        self.broadcast_entry(&marker);
    }

    fn broadcast_entry(&self, entry: &LogEntry) {
        self.events.broadcast(SupervisorEvent::Log {
            analysis_id: self.analysis_id.clone(),
            entry: entry.clone(),
        });
        self.events.broadcast(SupervisorEvent::LogStats {
            analysis_id: self.analysis_id.clone(),
            total_count: self.total_log_count,
            log_file_size: self.file.size(),
        });
    }
}

/// Serialize an entry into a line of at most `budget` bytes (newline
/// included), cutting the message from the end when it is too long
///
/// Returns `None` when not even an empty message fits.
fn fit_line(entry: &mut LogEntry, budget: u64) -> Option<String> {
    loop {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize log entry: {}", e);
                return None;
            }
        };

        let len = line.len() as u64 + 1;
        if len <= budget {
            return Some(line);
        }
        if entry.message.is_empty() {
            return None;
        }

        // An escaped byte takes at most 6 bytes (`\u00XX`), so this never
        // cuts more than a few bytes beyond what is needed
        let excess = (len - budget) as usize;
        let step = excess.div_ceil(6);
        let mut cut = entry.message.len().saturating_sub(step);
        while !entry.message.is_char_boundary(cut) {
            cut -= 1;
        }
        entry.message.truncate(cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SupervisorEvent>>,
    }

    impl EventSink for RecordingSink {
        fn broadcast(&self, event: SupervisorEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn manager_in(dir: &TempDir, max_memory_logs: usize, max_file_size: u64) -> LogManager {
        LogManager::new(
            "a1",
            dir.path().join("logs").join("analysis.log"),
            max_memory_logs,
            max_file_size,
            Arc::new(RecordingSink::default()),
        )
    }

    fn messages(page: &LogPage) -> Vec<&str> {
        page.logs.iter().map(|e| e.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_buffer_keeps_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 3, 1024 * 1024);

        for message in ["1", "2", "3", "4"] {
            manager.add_log(message).await;
        }

        let page = manager.get_memory_logs(1, 10);
        assert_eq!(messages(&page), vec!["4", "3", "2"]);
        assert_eq!(page.total_count, 4);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_buffer_size_is_min_of_n_and_cap() {
        let temp_dir = TempDir::new().unwrap();

        for (n, k) in [(0usize, 5usize), (2, 5), (5, 5), (12, 5), (7, 1)] {
            let mut manager = manager_in(&temp_dir, k, u64::MAX);
            manager.reset();
            for i in 0..n {
                manager.add_log(format!("line {}", i)).await;
            }

            let stats = manager.stats();
            assert_eq!(stats.memory_count, n.min(k));
            assert_eq!(stats.total_count, n as u64);

            let page = manager.get_memory_logs(1, usize::MAX);
            let sequences: Vec<u64> = page.logs.iter().map(|e| e.sequence).collect();
            assert!(sequences.windows(2).all(|w| w[0] > w[1]));
        }
    }

    #[tokio::test]
    async fn test_pagination() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 10, 1024 * 1024);

        for i in 1..=5 {
            manager.add_log(i.to_string()).await;
        }

        let first = manager.get_memory_logs(1, 2);
        assert_eq!(messages(&first), vec!["5", "4"]);
        assert!(first.has_more);

        let last = manager.get_memory_logs(3, 2);
        assert_eq!(messages(&last), vec!["1"]);
        assert!(!last.has_more);

        let beyond = manager.get_memory_logs(4, 2);
        assert!(beyond.logs.is_empty());
        assert!(!beyond.has_more);
        assert_eq!(beyond.total_count, 5);
    }

    #[tokio::test]
    async fn test_entries_are_written_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 10, 1024 * 1024);

        manager.add_log("hello").await;
        manager.add_log("world").await;

        let content = tokio::fs::read_to_string(manager.log_path()).await.unwrap();
        let lines: Vec<LogEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].sequence, 1);
        assert_eq!(lines[1].message, "world");
        assert_eq!(manager.stats().log_file_size, content.len() as u64);
    }

    #[tokio::test]
    async fn test_add_log_broadcasts_entry_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut manager = LogManager::new(
            "a1",
            temp_dir.path().join("analysis.log"),
            10,
            1024 * 1024,
            sink.clone(),
        );

        manager.add_log("hello").await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SupervisorEvent::Log { entry, .. } if entry.message == "hello"));
        assert!(matches!(
            &events[1],
            SupervisorEvent::LogStats { total_count: 1, log_file_size, .. } if *log_file_size > 0
        ));
    }

    #[tokio::test]
    async fn test_initialize_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 10, 1024);

        manager.initialize_log_state().await.unwrap();

        assert_eq!(manager.total_log_count(), 0);
        assert!(!manager.log_path().exists());
    }

    #[tokio::test]
    async fn test_initialize_restores_previous_run() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut manager = manager_in(&temp_dir, 10, 1024 * 1024);
            for i in 1..=4 {
                manager.add_log(i.to_string()).await;
            }
        }

        let mut manager = manager_in(&temp_dir, 2, 1024 * 1024);
        manager.initialize_log_state().await.unwrap();

        assert_eq!(manager.total_log_count(), 4);
        assert_eq!(messages(&manager.get_memory_logs(1, 10)), vec!["4", "3"]);

        let next = manager.add_log("5").await;
        assert_eq!(next.sequence, 5);
    }

    #[tokio::test]
    async fn test_initialize_oversized_file_is_cleared() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 10, 50 * 1024 * 1024);

        std::fs::create_dir_all(manager.log_path().parent().unwrap()).unwrap();
        let file = std::fs::File::create(manager.log_path()).unwrap();
        file.set_len(60 * 1024 * 1024).unwrap();
        drop(file);

        manager.initialize_log_state().await.unwrap();

        assert_eq!(manager.total_log_count(), 1);
        let page = manager.get_memory_logs(1, 10);
        assert!(page.logs[0].message.contains("cleared"));

        let size = std::fs::metadata(manager.log_path()).unwrap().len();
        assert!(size < 1024);
    }

    #[tokio::test]
    async fn test_runtime_cap_truncates_wholesale() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 100, 1024);

        for i in 0..40 {
            manager.add_log(format!("message number {}", i)).await;
        }

        let size = std::fs::metadata(manager.log_path()).unwrap().len();
        assert!(size <= 1024);

        let content = std::fs::read_to_string(manager.log_path()).unwrap();
        assert!(content.contains("was cleared"));
        assert!(content.contains("message number 39"));
        assert!(!content.contains("\"message number 0\""));
    }

    #[tokio::test]
    async fn test_cap_counts_escaped_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 100, 1024);

        manager.add_log("a").await;
        // Every quote doubles once escaped
        manager.add_log("\"".repeat(480)).await;

        let size = std::fs::metadata(manager.log_path()).unwrap().len();
        assert!(size <= 1024, "log file is {} bytes", size);
        assert_eq!(size, manager.stats().log_file_size);

        let content = std::fs::read_to_string(manager.log_path()).unwrap();
        assert!(content.contains("was cleared"));
        assert!(!content.contains("\"message\":\"a\""));
    }

    #[tokio::test]
    async fn test_single_oversized_entry_is_cut_to_fit() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 100, 512);

        let entry = manager.add_log("\u{1}".repeat(2_000)).await;

        let size = std::fs::metadata(manager.log_path()).unwrap().len();
        assert!(size <= 512, "log file is {} bytes", size);
        assert!(!entry.message.is_empty());
        assert!(entry.message.len() < 2_000);

        // What is kept in memory matches what was written
        let content = std::fs::read_to_string(manager.log_path()).unwrap();
        let written: LogEntry = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(written.message, entry.message);
    }

    #[test]
    fn test_fit_line_gives_up_on_tiny_budget() {
        let mut entry = LogEntry {
            sequence: 1,
            timestamp: Utc::now(),
            message: "hello".to_string(),
        };

        assert!(fit_line(&mut entry, 10).is_none());
        assert!(entry.message.is_empty());
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = manager_in(&temp_dir, 10, 1024 * 1024);

        manager.add_log("one").await;
        manager.add_log("two").await;
        manager.clear_logs().await.unwrap();

        assert_eq!(manager.total_log_count(), 1);
        assert_eq!(messages(&manager.get_memory_logs(1, 10)), vec!["Log file cleared"]);

        let content = std::fs::read_to_string(manager.log_path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
