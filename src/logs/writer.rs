use crate::error::{Result, SupervisorError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only log file of a single analysis
///
/// The file handle is opened lazily on the first append so that a supervisor
/// can be constructed without touching the filesystem. The tracked size is
/// the size of the file as this writer last saw it.
pub struct LogFile {
    path: PathBuf,
    file: Option<TokioFile>,
    size: u64,
}

impl LogFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            size: 0,
        }
    }

    /// Stat the file on disk and refresh the tracked size
    ///
    /// # Returns
    /// * `Ok(Some(size))` - File exists
    /// * `Ok(None)` - File does not exist
    pub async fn stat(&mut self) -> Result<Option<u64>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                self.size = meta.len();
                Ok(Some(meta.len()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.size = 0;
                Ok(None)
            }
            Err(e) => Err(SupervisorError::LogFileError(format!(
                "Failed to stat {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Append one line, adding the trailing newline
    pub async fn append_line(&mut self, line: &str) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(self.open().await?);
        }

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        if let Some(file) = self.file.as_mut() {
            file.write_all(&data)
                .await
                .map_err(|e| SupervisorError::LogError(format!("Failed to write to log: {}", e)))?;

            file.flush()
                .await
                .map_err(|e| SupervisorError::LogError(format!("Failed to flush log: {}", e)))?;
        }

        self.size += data.len() as u64;

        Ok(())
    }

    /// Drop all content while keeping the file in place
    pub async fn truncate(&mut self) -> Result<()> {
        // Closing and reopening with truncate keeps append-mode semantics intact
        self.file = None;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| SupervisorError::LogFileError(format!("Failed to truncate log: {}", e)))?;

        self.size = 0;

        Ok(())
    }

    /// Delete the file. A missing file is not an error.
    pub async fn remove(&mut self) -> Result<()> {
        self.file = None;
        self.size = 0;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::LogFileError(format!(
                "Failed to delete {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn open(&self) -> Result<TokioFile> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SupervisorError::LogError(format!("Failed to create log directory: {}", e))
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SupervisorError::LogFileError(format!("Failed to open log file: {}", e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}
