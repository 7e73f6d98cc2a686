//! Result sinks
//!
//! A sink receives exactly one record per job, in completion order.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::DispatchError;
use super::job::JobResult;

/// Destination for terminal job results
pub trait ResultSink {
    /// Durably record one result before returning
    fn append(&mut self, result: &JobResult) -> Result<(), DispatchError>;
}

/// Collects results in memory
impl ResultSink for Vec<JobResult> {
    fn append(&mut self, result: &JobResult) -> Result<(), DispatchError> {
        self.push(result.clone());
        Ok(())
    }
}

/// Appends one JSON record per line to a file
///
/// Each record is written with a single `write_all` of the full line and
/// flushed, so a crash can only leave the last line incomplete.
pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "JsonlSink::open: called");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonlSink {
    fn append(&mut self, result: &JobResult) -> Result<(), DispatchError> {
        let mut line = serde_json::to_string(&result.to_record())?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::job::Job;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.jsonl");

        let mut sink = JsonlSink::open(&path).unwrap();
        let a = JobResult::success(Job::new(0, json!({"input": "a"}), Some(json!({"id": 1})), 1), json!({"ok": true}));
        let mut failed = Job::new(1, json!({"input": "b"}), Some(json!({"id": 2})), 1);
        failed.errors.push("boom".to_string());
        let b = JobResult::failure(failed);
        sink.append(&a).unwrap();
        sink.append(&b).unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!([{"input": "a"}, {"ok": true}, {"id": 1}]));
        assert_eq!(lines[1], json!([{"input": "b"}, ["boom"], {"id": 2}]));
    }

    #[test]
    fn test_jsonl_sink_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");
        let result = JobResult::success(Job::new(0, json!({}), None, 1), json!({}));

        JsonlSink::open(&path).unwrap().append(&result).unwrap();
        JsonlSink::open(&path).unwrap().append(&result).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
