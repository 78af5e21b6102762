//! Run report: one JSON document per session plus a terminal summary.
//!
//! The report file maps session ids to [`RunReport`]s. A report template
//! without `{sessionid}` therefore accumulates sessions in one file.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use crate::checks::Combination;
use crate::errors::{FailureKind, PipelineError};
use crate::pipeline::TestInstance;
use crate::validate::{Evaluation, MetricValue, SanityOutcome};

/// New session id from the local clock and process id
pub fn new_session_id() -> String {
    format!(
        "{}-{}",
        Local::now().format("%Y%m%dT%H%M%S"),
        std::process::id()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&PipelineError> for FailureRecord {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one test instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub name: String,
    pub check: String,
    pub system: String,
    pub partition: String,
    pub environ: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: Combination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_dir: Option<PathBuf>,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanity: Option<SanityOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: f64,
}

impl InstanceReport {
    /// A passing report for `instance`, to be filled in as it runs
    pub fn new(instance: &TestInstance) -> Self {
        Self {
            name: instance.name.clone(),
            check: instance.check.clone(),
            system: instance.system.clone(),
            partition: instance.partition.name.clone(),
            environ: instance.environ.name.clone(),
            parameters: instance.parameters.clone(),
            stage_dir: Some(instance.stage_dir.clone()),
            status: InstanceStatus::Passed,
            job_id: None,
            exit_code: None,
            sanity: None,
            metrics: Vec::new(),
            failure: None,
            started_at: None,
            duration_secs: 0.0,
        }
    }

    /// A check that never produced instances because it could not be
    /// resolved
    pub fn rejected(check: &str, system: &str, err: &PipelineError) -> Self {
        Self {
            name: check.to_string(),
            check: check.to_string(),
            system: system.to_string(),
            partition: String::new(),
            environ: String::new(),
            parameters: Combination::new(),
            stage_dir: None,
            status: InstanceStatus::Failed,
            job_id: None,
            exit_code: None,
            sanity: None,
            metrics: Vec::new(),
            failure: Some(err.into()),
            started_at: None,
            duration_secs: 0.0,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == InstanceStatus::Passed
    }

    pub fn fail(&mut self, err: &PipelineError) {
        self.status = InstanceStatus::Failed;
        self.failure = Some(err.into());
    }

    /// Record an evaluation; its failure, if any, fails the instance
    pub fn record_evaluation(&mut self, evaluation: Evaluation) {
        if let Some(err) = evaluation.failure() {
            self.fail(&err);
        }
        self.sanity = Some(evaluation.sanity);
        self.metrics = evaluation.metrics;
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Counts by outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Failure count per kind
    #[serde(default)]
    pub failures: BTreeMap<String, usize>,
}

/// One orchestration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: String,
    pub system: String,
    #[serde(default)]
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    pub fn new(session_id: &str, system: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            system: system.to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
            started_at: Utc::now(),
            finished_at: None,
            summary: RunSummary::default(),
            instances: Vec::new(),
        }
    }

    pub fn push(&mut self, instance: InstanceReport) {
        self.instances.push(instance);
    }

    /// Close the session and compute the summary
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        let mut summary = RunSummary {
            total: self.instances.len(),
            ..Default::default()
        };
        for instance in &self.instances {
            if instance.passed() {
                summary.passed += 1;
            } else {
                summary.failed += 1;
                if let Some(kind) = instance.failure_kind() {
                    *summary.failures.entry(kind.to_string()).or_default() += 1;
                }
            }
        }
        self.summary = summary;
    }

    pub fn all_passed(&self) -> bool {
        self.instances.iter().all(|i| i.passed())
    }

    pub fn get(&self, name: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Add this session to the report file at `path`, keeping sessions
    /// already stored there
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut sessions = if path.exists() {
            match load_reports(path) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("Replacing unreadable report {}: {:#}", path.display(), e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        sessions.insert(self.session_id.clone(), self.clone());
        let content = serde_json::to_string_pretty(&sessions)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Wrote run report {}", path.display());
        Ok(())
    }

    pub fn summary_rows(&self) -> Vec<SummaryRow> {
        self.instances.iter().map(SummaryRow::from).collect()
    }
}

/// Sessions stored in a report file, by session id
pub fn load_reports(path: &Path) -> Result<BTreeMap<String, RunReport>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid report {}", path.display()))
}

/// One line of the terminal summary
#[derive(Debug, Clone, Tabled)]
pub struct SummaryRow {
    #[tabled(rename = "Instance")]
    pub name: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Failure")]
    pub failure: String,
    #[tabled(rename = "Metrics")]
    pub metrics: String,
}

impl From<&InstanceReport> for SummaryRow {
    fn from(report: &InstanceReport) -> Self {
        let metrics = report
            .metrics
            .iter()
            .map(|m| match m.value {
                Some(v) => format!("{}={} {}", m.name, v, m.unit),
                None => format!("{}=n/a", m.name),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            name: report.name.clone(),
            status: match report.status {
                InstanceStatus::Passed => "PASS".to_string(),
                InstanceStatus::Failed => "FAIL".to_string(),
            },
            failure: report
                .failure
                .as_ref()
                .map(|f| format!("{}: {}", f.kind, f.message))
                .unwrap_or_default(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(name: &str, err: PipelineError) -> InstanceReport {
        InstanceReport::rejected(name, "casper", &err)
    }

    #[test]
    fn test_summary_counts() {
        let mut report = RunReport::new("s1", "casper");
        report.push(failed(
            "CM1QuickTest @casper:compute+gnu",
            PipelineError::Sanity("cm1 did not finish".into()),
        ));
        report.push(failed(
            "CM1RestartTest @casper:compute+gnu",
            PipelineError::DependencyFailed {
                dependency: "CM1QuickTest @casper:compute+gnu".into(),
            },
        ));
        report.finish();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.failures["SanityFailure"], 1);
        assert_eq!(report.summary.failures["DependencyFailed"], 1);
        assert!(!report.all_passed());
        assert!(report.summary_rows()[0].failure.starts_with("SanityFailure"));
    }

    #[test]
    fn test_write_keeps_other_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reports/run-report.json");
        let mut first = RunReport::new("20260101T000000-1", "casper");
        first.finish();
        first.write(&path).unwrap();
        let mut second = RunReport::new("20260101T010000-2", "casper");
        second.finish();
        second.write(&path).unwrap();

        let sessions = load_reports(&path).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains_key("20260101T000000-1"));
        assert_eq!(sessions["20260101T010000-2"].system, "casper");
    }
}
