//! CSV dump of per-stressor summaries

use crate::metrics::{MetricSummary, StressorSummary};
use serde::{Deserialize, Serialize};
use std::{io, path::Path};
use thiserror::Error;

/// Default summary location
pub const DEFAULT_LOCATION: &str = "./bogostress.csv";

/// Save summaries to a CSV file
pub fn save<'a>(
    path: impl AsRef<Path>,
    summaries: impl IntoIterator<Item = &'a StressorSummary>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for summary in summaries {
        writer.serialize(SummaryRecord::from(summary))?;
    }
    writer.flush()?;
    Ok(())
}

/// Load previously saved summaries
pub fn load(path: impl AsRef<Path>) -> Result<Vec<SummaryRecord>, SummaryLoadError> {
    let mut reader = match csv::Reader::from_path(path.as_ref()) {
        Err(e) => match e.kind() {
            csv::ErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SummaryLoadError::FileNotFound)
            }
            _other => return Err(SummaryLoadError::ParseError(e)),
        },
        other => other?,
    };

    let mut result = Vec::new();
    for record in reader.deserialize() {
        result.push(record?);
    }
    Ok(result)
}

/// Failure to load summaries from a file
#[derive(Debug, Error)]
pub enum SummaryLoadError {
    /// Summary file not found
    #[error("summary file not found")]
    FileNotFound,

    /// Failed to process the summary file for another reason
    #[error("failed to process summary file ({0})")]
    ParseError(#[from] csv::Error),
}

/// Record from the summary CSV file
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SummaryRecord {
    /// Stressor name
    pub stressor: String,

    /// Run group (nonzero only in permute mode)
    pub group: usize,

    /// Number of instances
    pub instances: u32,

    /// Instances that passed
    pub passed: u32,

    /// Instances that failed
    pub failed: u32,

    /// Instances that were skipped
    pub skipped: u32,

    /// Instances with untrustworthy metrics
    pub bad_metrics: u32,

    /// Instances whose shared-memory numbers were inconsistent
    pub integrity_failures: u32,

    /// Total bogo-ops
    pub bogo_ops: u64,

    /// Mean real time per instance in seconds
    #[serde(rename = "real_time")]
    pub real_time_secs: f64,

    /// Total user time in seconds
    #[serde(rename = "user_time")]
    pub user_time_secs: f64,

    /// Total system time in seconds
    #[serde(rename = "sys_time")]
    pub sys_time_secs: f64,

    /// Bogo-ops per second of real time
    pub ops_per_sec_real: f64,

    /// Bogo-ops per second of CPU time
    pub ops_per_sec_cpu: f64,

    /// Largest resident set size in KiB
    pub max_rss_kib: u64,

    /// Named metrics, as a JSON array
    pub metrics: String,
}
//
impl SummaryRecord {
    /// Decode the named metrics
    pub fn metrics(&self) -> serde_json::Result<Vec<MetricSummary>> {
        serde_json::from_str(&self.metrics)
    }
}
//
impl From<&StressorSummary> for SummaryRecord {
    fn from(summary: &StressorSummary) -> Self {
        Self {
            stressor: summary.stressor.to_owned(),
            group: summary.group,
            instances: summary.instances,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            bad_metrics: summary.bad_metrics,
            integrity_failures: summary.integrity_failures,
            bogo_ops: summary.bogo_ops,
            real_time_secs: summary.real_time.as_secs_f64(),
            user_time_secs: summary.user_time.as_secs_f64(),
            sys_time_secs: summary.sys_time.as_secs_f64(),
            ops_per_sec_real: summary.ops_per_sec_real,
            ops_per_sec_cpu: summary.ops_per_sec_cpu,
            max_rss_kib: summary.max_rss_kib,
            // Non-finite values become null, nothing else can fail
            metrics: serde_json::to_string(&summary.metrics).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::MeanKind;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn summary(stressor: &'static str, bogo_ops: u64) -> StressorSummary {
        StressorSummary {
            stressor,
            group: 0,
            instances: 2,
            passed: 1,
            failed: 0,
            skipped: 1,
            bad_metrics: 0,
            integrity_failures: 0,
            bogo_ops,
            real_time: Duration::from_millis(1500),
            user_time: Duration::from_secs(1),
            sys_time: Duration::from_millis(250),
            ops_per_sec_real: 2.0,
            ops_per_sec_cpu: 2.4,
            max_rss_kib: 1024,
            metrics: Vec::new(),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let summaries = [summary("cpu", 3), summary("vm", 0)];
        save(&path, &summaries).unwrap();
        let records = load(&path).unwrap();
        assert_eq!(
            records,
            summaries.iter().map(SummaryRecord::from).collect::<Vec<_>>()
        );
        assert_eq!(records[0].real_time_secs, 1.5);
    }

    #[test]
    fn integrity_and_metrics_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let mut corrupted = summary("cpu", 3);
        corrupted.integrity_failures = 1;
        corrupted.metrics = vec![
            MetricSummary {
                description: "crunch rounds per second, with commas".into(),
                kind: MeanKind::GeometricMean,
                value: Some(1.5),
            },
            MetricSummary {
                description: "unused".into(),
                kind: MeanKind::Total,
                value: None,
            },
        ];
        save(&path, [&corrupted]).unwrap();
        let [record] = &load(&path).unwrap()[..] else {
            panic!("expected one record")
        };
        assert_eq!(record.integrity_failures, 1);
        assert_eq!(record.failed, 0);
        assert_eq!(record.metrics().unwrap(), corrupted.metrics);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            load(dir.path().join("nope.csv")),
            Err(SummaryLoadError::FileNotFound)
        );
    }

    #[test]
    fn bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"stressor,group\ncpu,notanumber\n").unwrap();
        assert_matches!(load(file.path()), Err(SummaryLoadError::ParseError(_)));
    }
}
