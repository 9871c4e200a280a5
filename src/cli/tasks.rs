//! Task payload files
//!
//! A payload file is the JSON body of a desired-state message:
//!
//! ```json
//! { "seq_num": 1, "tasks": [ { "arn": "...", "family": "...", ... } ] }
//! ```
//!
//! `seq_num` defaults to 1 when omitted.

use crate::dependency::{self, DependencyError};
use crate::task::TaskSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("IO error reading '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Task payload parsing error in '{path}': {reason}")]
    ParseError { path: PathBuf, reason: String },
}

fn default_seq_num() -> u64 {
    1
}

/// Desired-state payload read from disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayloadFile {
    #[serde(default = "default_seq_num")]
    pub seq_num: u64,
    pub tasks: Vec<TaskSpec>,
}

impl TaskPayloadFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FileError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                FileError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                FileError::IoError {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, FileError> {
        let payload: TaskPayloadFile =
            serde_json::from_str(content).map_err(|e| FileError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!(
            "Loaded {} task(s) at seq {} from {:?}",
            payload.tasks.len(),
            payload.seq_num,
            path
        );
        Ok(payload)
    }

    /// Run dependency validation on every task. Returns the arn and error of
    /// each task that would be rejected.
    pub fn validate(&self) -> Vec<(String, DependencyError)> {
        self.tasks
            .iter()
            .filter_map(|spec| {
                dependency::validate(spec)
                    .err()
                    .map(|e| (spec.arn.clone(), e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: &str = r#"{
        "tasks": [
            {
                "arn": "arn:task/web",
                "family": "web",
                "desired_status": "RUNNING",
                "containers": [
                    { "name": "app", "image": "nginx:latest" },
                    {
                        "name": "sidecar",
                        "image": "busybox",
                        "essential": false,
                        "depends_on": [ { "container_name": "app", "condition": "START" } ]
                    }
                ]
            },
            {
                "arn": "arn:task/loop",
                "family": "loop",
                "desired_status": "RUNNING",
                "containers": [
                    {
                        "name": "a",
                        "image": "busybox",
                        "depends_on": [ { "container_name": "b", "condition": "START" } ]
                    },
                    {
                        "name": "b",
                        "image": "busybox",
                        "depends_on": [ { "container_name": "a", "condition": "START" } ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_load_payload_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.json");
        fs::write(&path, PAYLOAD).unwrap();

        let payload = TaskPayloadFile::load(&path).unwrap();
        assert_eq!(payload.seq_num, 1);
        assert_eq!(payload.tasks.len(), 2);
        assert_eq!(payload.tasks[0].containers.len(), 2);
        assert!(!payload.tasks[0].containers[1].essential);
    }

    #[test]
    fn test_validate_reports_rejected_tasks() {
        let payload = TaskPayloadFile::parse(PAYLOAD, Path::new("payload.json")).unwrap();
        let rejected = payload.validate();

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "arn:task/loop");
        assert!(matches!(rejected[0].1, DependencyError::Cycle(_)));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let err = TaskPayloadFile::load("/nonexistent/payload.json").unwrap_err();
        assert!(matches!(err, FileError::NotFound { .. }));

        let err = TaskPayloadFile::parse("{ \"tasks\": 3 }", Path::new("bad.json")).unwrap_err();
        assert!(matches!(err, FileError::ParseError { .. }));
    }
}
