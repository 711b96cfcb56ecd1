use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{LogRecord, LogSink, Severity};

/// How many flush signals may queue up before new ones are dropped. A full
/// queue already guarantees a pending flush, and every flush writes the
/// latest snapshot, so dropped signals lose nothing.
const WRITER_QUEUE: usize = 8;

#[derive(Debug)]
enum WriterOp {
    Flush,
    Clear,
}

/// File-backed [`LogSink`].
///
/// Records live in memory behind an `RwLock`; `append` pushes synchronously
/// and nudges a background writer task, which serializes the full record
/// list to a JSON file. Storage errors are logged and swallowed.
pub struct FileLogSink {
    records: Arc<RwLock<Vec<LogRecord>>>,
    writer_tx: mpsc::Sender<WriterOp>,
    path: PathBuf,
}

impl FileLogSink {
    /// Opens the sink at `path`, loading any previously persisted records.
    /// A missing or unreadable file starts the log empty rather than
    /// failing, so the application remains usable with a fresh log.
    pub async fn open(path: PathBuf) -> Self {
        let initial = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Vec<LogRecord>>(&content) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Ignoring unparseable log file {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Could not create log directory {}: {}", parent.display(), e);
            }
        }

        let records = Arc::new(RwLock::new(initial));
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(run_writer(records.clone(), path.clone(), writer_rx));

        Self {
            records,
            writer_tx,
            path,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<LogRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<LogRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogSink for FileLogSink {
    fn append(&self, text: &str, severity: Severity) {
        if text.trim().is_empty() {
            return;
        }
        self.write().push(LogRecord::now(text, severity));
        // A full queue means a flush is already pending; dropping is fine.
        let _ = self.writer_tx.try_send(WriterOp::Flush);
    }

    fn list(&self) -> Vec<LogRecord> {
        self.read().clone()
    }

    fn clear(&self) {
        self.write().clear();
        let _ = self.writer_tx.try_send(WriterOp::Clear);
    }
}

async fn run_writer(
    records: Arc<RwLock<Vec<LogRecord>>>,
    path: PathBuf,
    mut rx: mpsc::Receiver<WriterOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriterOp::Flush => {
                let snapshot = records.read().unwrap_or_else(|e| e.into_inner()).clone();
                let body = match serde_json::to_string_pretty(&snapshot) {
                    Ok(body) => body,
                    Err(e) => {
                        error!("Failed to serialize log records: {}", e);
                        continue;
                    }
                };
                if let Err(e) = tokio::fs::write(&path, body).await {
                    error!("Failed to write log file {}: {}", path.display(), e);
                }
            }
            WriterOp::Clear => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!("Failed to delete log file {}: {}", path.display(), e);
                    }
                }
            }
        }
    }
    debug!("Log writer for {} stopped", path.display());
}
