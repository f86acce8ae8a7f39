//! Result sinks
//!
//! Every completed fetch is handed to the configured sink as it finishes,
//! so a long run leaves a partial record even if it never completes.
//! - [`FileSink`] appends one line per fetch to a text file
//! - [`MemorySink`] keeps the results for inspection

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ProbeError, Result};
use crate::report::CircuitResult;

/// Receives each completed fetch
pub trait ResultSink: Send + Sync {
    fn record(&self, result: &CircuitResult) -> Result<()>;
}

/// Appends `<exit fingerprint> <country> <id> <id> ...` lines to a file
///
/// The file is opened per record in append mode, so concurrent probes
/// sharing one file interleave whole lines.
pub struct FileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for FileSink {
    fn record(&self, result: &CircuitResult) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                ProbeError::Storage(format!("Failed to open {}: {}", self.path.display(), e))
            })?;

        writeln!(file, "{}", result.to_record_line()).map_err(|e| {
            ProbeError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        log::debug!(
            "💾 Recorded {} identifiers from exit {}",
            result.identifiers.len(),
            result.exit_fingerprint
        );
        Ok(())
    }
}

/// Keeps every recorded result in memory
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<CircuitResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn results(&self) -> Vec<CircuitResult> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for MemorySink {
    fn record(&self, result: &CircuitResult) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CircuitId;

    fn result(id: u64, cc: &str, ids: &[&str]) -> CircuitResult {
        CircuitResult {
            circuit_id: CircuitId(id),
            exit_fingerprint: "AB".repeat(20),
            exit_nickname: "exit".into(),
            exit_country: cc.into(),
            status: 200,
            identifiers: ids.iter().map(|s| s.to_string()).collect(),
            byte_length: 0,
            consistent_binding: true,
        }
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        let sink = FileSink::new(&path);

        sink.record(&result(1, "de", &["1", "2"])).unwrap();
        sink.record(&result(2, "fr", &[])).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{} de 1 2", "AB".repeat(20)));
        assert_eq!(lines[1], format!("{} fr", "AB".repeat(20)));
    }

    #[test]
    fn test_file_sink_keeps_existing_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "previous run").unwrap();

        let sink = FileSink::new(file.path());
        sink.record(&result(1, "se", &["9"])).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("previous run\n"));
        assert!(content.ends_with(" se 9\n"));
    }

    #[test]
    fn test_file_sink_reports_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("missing").join("results.txt"));
        let err = sink.record(&result(1, "de", &["1"])).unwrap_err();
        assert!(matches!(err, ProbeError::Storage(_)));
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.record(&result(3, "nl", &["4"])).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.results()[0].circuit_id, CircuitId(3));
    }
}
