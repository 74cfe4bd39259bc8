//! Local request log
//!
//! One NDJSON record per completed request:
//!
//! ```text
//! {"requestId":"0192...","dimensions":[{"name":"status","value":"200"}]}
//! ```

use crate::error::LogError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

/// A captured dimension value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything captured for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub request_id: String,
    pub dimensions: Vec<Dimension>,
}

impl LogRecord {
    /// Value of the first dimension called `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

/// Destination for request records
pub trait LogSink: Send + Sync {
    /// Write one record
    fn record(&self, record: &LogRecord) -> Result<(), LogError>;

    /// Flush buffered records
    fn flush(&self) -> Result<(), LogError>;
}

/// Writes records to any `Write`, stdout by default
pub struct WriterLogSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterLogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl Default for WriterLogSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl LogSink for WriterLogSink {
    fn record(&self, record: &LogRecord) -> Result<(), LogError> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), LogError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for WriterLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterLogSink").finish_non_exhaustive()
    }
}

/// Appends records to a file
pub struct FileLogSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileLogSink {
    /// Open (or create) the log file
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn record(&self, record: &LogRecord) -> Result<(), LogError> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), LogError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for FileLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLogSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory sink for tests
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: RwLock<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record for a request id
    pub fn find(&self, request_id: &str) -> Option<LogRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.request_id == request_id)
            .cloned()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, record: &LogRecord) -> Result<(), LogError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> LogRecord {
        LogRecord {
            request_id: "0192d3a4".into(),
            dimensions: vec![
                Dimension::new("url", "https://example.com/x"),
                Dimension::new("status", "200"),
            ],
        }
    }

    #[test]
    fn test_record_shape() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "requestId": "0192d3a4",
                "dimensions": [
                    {"name": "url", "value": "https://example.com/x"},
                    {"name": "status", "value": "200"}
                ]
            })
        );
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryLogSink::new();
        sink.record(&record()).unwrap();
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.find("0192d3a4").unwrap().get("status"), Some("200"));
        assert!(sink.find("other").is_none());
    }

    #[test]
    fn test_file_sink_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("packtap.ndjson");

        let sink = FileLogSink::new(&path).unwrap();
        sink.record(&record()).unwrap();
        sink.record(&record()).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: LogRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, record());
    }
}
