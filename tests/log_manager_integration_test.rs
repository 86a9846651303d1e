// Integration test for the log manager's file mirror and history reload

use analysis_supervisor::events::{EventSink, SupervisorEvent};
use analysis_supervisor::logs::{load_log_file, LogManager};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SupervisorEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<SupervisorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn broadcast(&self, event: SupervisorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn manager(dir: &TempDir, max_memory_logs: usize, sink: Arc<RecordingSink>) -> LogManager {
    LogManager::new(
        "a1",
        dir.path().join("logs").join("analysis.log"),
        max_memory_logs,
        1024 * 1024,
        sink,
    )
}

#[tokio::test]
async fn test_history_survives_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let mut logs = manager(&temp_dir, 100, Arc::new(RecordingSink::default()));
        logs.initialize_log_state().await.unwrap();
        for i in 1..=5 {
            logs.add_log(format!("message {}", i)).await;
        }
        assert_eq!(logs.total_log_count(), 5);
    }

    // A fresh manager over the same file picks up where the old one stopped
    let mut logs = manager(&temp_dir, 3, Arc::new(RecordingSink::default()));
    logs.initialize_log_state().await.unwrap();

    let page = logs.get_memory_logs(1, 10);
    assert_eq!(page.total_count, 5);
    assert_eq!(page.logs.len(), 3);
    assert_eq!(page.logs[0].message, "message 5");
    assert_eq!(page.logs[2].message, "message 3");
    assert!(!page.has_more);

    let entry = logs.add_log("message 6").await;
    assert_eq!(entry.sequence, 6);
    assert_eq!(logs.total_log_count(), 6);
}

#[tokio::test]
async fn test_file_matches_memory() {
    let temp_dir = TempDir::new().unwrap();
    let mut logs = manager(&temp_dir, 100, Arc::new(RecordingSink::default()));

    logs.add_log("first").await;
    logs.add_log("second").await;

    let loaded = load_log_file(logs.log_path(), 10).await.unwrap();
    assert_eq!(loaded.total_count, 2);
    assert_eq!(loaded.last_sequence, 2);

    let messages: Vec<_> = loaded.recent.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["second", "first"]);
}

#[tokio::test]
async fn test_clear_logs_leaves_marker_and_notifies() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mut logs = manager(&temp_dir, 100, Arc::clone(&sink));

    logs.add_log("before clear").await;
    logs.clear_logs().await.unwrap();

    let page = logs.get_memory_logs(1, 10);
    assert_eq!(page.total_count, 1);
    assert_eq!(page.logs[0].message, "Log file cleared");
    assert_eq!(page.logs[0].sequence, 1);

    let loaded = load_log_file(logs.log_path(), 10).await.unwrap();
    assert_eq!(loaded.total_count, 1);
    assert_eq!(loaded.recent[0].message, "Log file cleared");

    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, SupervisorEvent::LogsCleared { analysis_id } if analysis_id == "a1")));
}

#[tokio::test]
async fn test_every_entry_is_broadcast() {
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mut logs = manager(&temp_dir, 100, Arc::clone(&sink));

    logs.add_log("one").await;
    logs.add_log("two").await;

    let broadcast: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SupervisorEvent::Log { entry, .. } => Some(entry.message),
            _ => None,
        })
        .collect();
    assert_eq!(broadcast, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn test_oversized_file_is_replaced_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("logs").join("analysis.log");
    std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
    std::fs::write(&log_path, vec![b'x'; 4096]).unwrap();

    let mut logs = LogManager::new(
        "a1",
        &log_path,
        100,
        1024,
        Arc::new(RecordingSink::default()),
    );
    logs.initialize_log_state().await.unwrap();

    let page = logs.get_memory_logs(1, 10);
    assert_eq!(page.total_count, 1);
    assert!(page.logs[0].message.contains("limit"));
    assert!(std::fs::metadata(&log_path).unwrap().len() < 1024);
}
