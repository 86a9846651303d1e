use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// A single recorded log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing per analysis
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    /// Format the log entry for display
    pub fn format(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message
        )
    }

    /// Parse one line of the on-disk log
    ///
    /// Structured lines are JSON objects. Anything else is treated as a legacy
    /// plain-text line of the form `[timestamp] message` (or just `message`)
    /// and receives the given fallback sequence number.
    fn parse(line: &str, fallback_sequence: u64) -> Self {
        if let Ok(entry) = serde_json::from_str::<LogEntry>(line) {
            return entry;
        }

        let message = if line.starts_with('[') {
            match line.find(']') {
                Some(end_bracket) => line[end_bracket + 1..].trim_start().to_string(),
                None => line.to_string(),
            }
        } else {
            line.to_string()
        };

        Self {
            sequence: fallback_sequence,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Result of scanning an existing log file
#[derive(Debug, Default)]
pub struct LoadedLog {
    /// Number of entries found in the file
    pub total_count: u64,
    /// Highest sequence number seen
    pub last_sequence: u64,
    /// Most recent entries, newest first
    pub recent: VecDeque<LogEntry>,
}

/// Read an existing log file, keeping only the newest `keep` entries
///
/// A missing file yields an empty result.
pub async fn load_log_file(path: &Path, keep: usize) -> Result<LoadedLog> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadedLog::default()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut loaded = LoadedLog::default();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }

        // A torn write can leave invalid UTF-8 behind; keep the rest readable
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let entry = LogEntry::parse(line, loaded.last_sequence + 1);
        loaded.total_count += 1;
        loaded.last_sequence = loaded.last_sequence.max(entry.sequence);

        loaded.recent.push_front(entry);
        if loaded.recent.len() > keep {
            loaded.recent.pop_back();
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_line(sequence: u64, message: &str) -> String {
        serde_json::to_string(&LogEntry {
            sequence,
            timestamp: Utc::now(),
            message: message.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = load_log_file(&temp_dir.path().join("none.log"), 10)
            .await
            .unwrap();

        assert_eq!(loaded.total_count, 0);
        assert_eq!(loaded.last_sequence, 0);
        assert!(loaded.recent.is_empty());
    }

    #[tokio::test]
    async fn test_load_keeps_newest_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("analysis.log");
        let content: Vec<String> = (1..=5).map(|i| entry_line(i, &i.to_string())).collect();
        tokio::fs::write(&path, content.join("\n") + "\n").await.unwrap();

        let loaded = load_log_file(&path, 3).await.unwrap();

        assert_eq!(loaded.total_count, 5);
        assert_eq!(loaded.last_sequence, 5);
        let messages: Vec<&str> = loaded.recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["5", "4", "3"]);
    }

    #[tokio::test]
    async fn test_load_legacy_plain_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("analysis.log");
        let content = format!(
            "{}\n[2024-01-01 10:00:00.000] legacy message\n\nplain message\n",
            entry_line(7, "structured")
        );
        tokio::fs::write(&path, content).await.unwrap();

        let loaded = load_log_file(&path, 10).await.unwrap();

        assert_eq!(loaded.total_count, 3);
        assert_eq!(loaded.last_sequence, 9);
        assert_eq!(loaded.recent[0].message, "plain message");
        assert_eq!(loaded.recent[0].sequence, 9);
        assert_eq!(loaded.recent[1].message, "legacy message");
        assert_eq!(loaded.recent[2].message, "structured");
    }

    #[tokio::test]
    async fn test_load_survives_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("analysis.log");
        let mut content = (entry_line(1, "before crash") + "\n").into_bytes();
        content.extend_from_slice(b"\xff\xfe partial");
        tokio::fs::write(&path, content).await.unwrap();

        let loaded = load_log_file(&path, 10).await.unwrap();

        assert_eq!(loaded.total_count, 2);
        assert_eq!(loaded.last_sequence, 2);
        assert_eq!(loaded.recent[1].message, "before crash");
        assert!(loaded.recent[0].message.ends_with("partial"));
    }

    #[test]
    fn test_format_entry() {
        let entry = LogEntry {
            sequence: 1,
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T12:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            message: "hello".to_string(),
        };

        assert_eq!(entry.format(), "[2024-05-01 12:30:00.000] hello");
    }
}
