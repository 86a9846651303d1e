// Logs module - In-memory log history with an append-only file mirror

mod manager;
mod reader;
mod writer;

pub use manager::{LogManager, LogPage, LogStats};
pub use reader::{load_log_file, LoadedLog, LogEntry};
pub use writer::LogFile;
