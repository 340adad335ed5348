//! JSON job files
//!
//! A job file lists the stressors to run, as an array of
//! `{"stressor": NAME, "instances": N, "ops": N}` objects. `instances`
//! defaults to 0 (one per CPU) and `ops` to 0 (unbounded).

use crate::runs::RunRequest;
use serde::Deserialize;
use serde_json as json;
use std::{io, path::Path, str::FromStr};
use thiserror::Error;

/// Parsed job file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobFile(Vec<JobEntry>);
//
impl JobFile {
    /// Load a job file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JobLoadError> {
        let data = match std::fs::read_to_string(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(JobLoadError::FileNotFound),
            other => other?,
        };
        Ok(Self::from_str(&data)?)
    }

    /// Entries in file order
    pub fn entries(&self) -> impl Iterator<Item = &JobEntry> {
        self.0.iter()
    }

    /// Turn the entries into run requests
    pub fn requests(&self) -> Vec<RunRequest> {
        self.entries().map(JobEntry::request).collect()
    }
}
//
impl FromStr for JobFile {
    type Err = json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        json::from_str::<Vec<JobEntry>>(s).map(Self)
    }
}

/// Failure to load a job file
#[derive(Debug, Error)]
pub enum JobLoadError {
    /// Job file not found
    #[error("job file not found")]
    FileNotFound,

    /// Other I/O error
    #[error("failed to load job file ({0})")]
    IoError(#[from] io::Error),

    /// Failed to parse the job file
    #[error("failed to parse job file ({0})")]
    ParseError(#[from] json::Error),
}

/// One entry from a job file
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobEntry {
    /// Stressor name
    stressor: Box<str>,

    /// Number of instances, 0 means one per CPU
    #[serde(default)]
    instances: u32,

    /// Total bogo-op budget, 0 means unbounded
    #[serde(default)]
    ops: u64,
}
//
impl JobEntry {
    /// Stressor name
    pub fn stressor(&self) -> &str {
        &self.stressor
    }

    /// Number of instances
    pub fn instances(&self) -> u32 {
        self.instances
    }

    /// Total bogo-op budget
    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// Equivalent run request
    pub fn request(&self) -> RunRequest {
        RunRequest {
            stressor: self.stressor.to_string(),
            instances: self.instances,
            ops: self.ops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse() {
        let jobs = JobFile::from_str(
            r#"[
                {"stressor": "cpu", "instances": 4, "ops": 100},
                {"stressor": "vm"}
            ]"#,
        )
        .unwrap();
        assert_eq!(
            jobs.requests(),
            [
                RunRequest {
                    stressor: "cpu".into(),
                    instances: 4,
                    ops: 100
                },
                RunRequest {
                    stressor: "vm".into(),
                    instances: 0,
                    ops: 0
                }
            ]
        );
        assert_eq!(jobs.entries().next().unwrap().stressor(), "cpu");
    }

    #[test]
    fn unknown_fields() {
        assert!(JobFile::from_str(r#"[{"stressor": "cpu", "timeout": 3}]"#).is_err());
        assert!(JobFile::from_str(r#"[{"instances": 3}]"#).is_err());
    }

    #[test]
    fn load() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            JobFile::load(dir.path().join("missing.json")),
            Err(JobLoadError::FileNotFound)
        );
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, r#"[{"stressor": "nop", "ops": 5}]"#).unwrap();
        let jobs = JobFile::load(&path).unwrap();
        assert_eq!(jobs.entries().map(JobEntry::ops).collect::<Vec<_>>(), [5]);
        std::fs::write(&path, "not json").unwrap();
        assert_matches!(JobFile::load(&path), Err(JobLoadError::ParseError(_)));
    }
}
