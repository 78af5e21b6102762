//! Session-wide options: where checks live, where stages and reports go,
//! and how the orchestrator paces itself.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;

/// General options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directories or files searched for suite files. `${VAR}` is expanded
    /// from the environment.
    pub check_search_path: Vec<String>,

    /// Descend into subdirectories of the search path
    pub check_search_recursive: bool,

    /// Root of the per-instance stage directories
    pub stage_dir: PathBuf,

    /// Report file template; `{sessionid}` is replaced with the session id
    pub report_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            check_search_path: vec!["suites".to_string()],
            check_search_recursive: true,
            stage_dir: PathBuf::from("stage"),
            report_file: "reports/run-report-{sessionid}.json".to_string(),
        }
    }
}

impl GeneralConfig {
    /// Search paths with environment variables expanded
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.check_search_path
            .iter()
            .map(|p| PathBuf::from(expand_env_vars(p)))
            .collect()
    }

    /// Report path for a session
    pub fn report_path(&self, session_id: &str) -> PathBuf {
        PathBuf::from(expand_env_vars(
            &self.report_file.replace("{sessionid}", session_id),
        ))
    }
}

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}|\$(\w+)").expect("static regex"));

/// Replace `${VAR}` and `$VAR` with environment values. Unset variables are
/// left untouched so the problem shows up in the path instead of vanishing.
pub fn expand_env_vars(value: &str) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            match name.and_then(|n| env::var(n).ok()) {
                Some(v) => v,
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Orchestrator pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Seconds between batch job status polls
    pub poll_interval: f64,

    /// Maximum number of instances in flight at once
    pub max_concurrent: usize,

    /// Kill a build that runs longer than this
    pub build_timeout_secs: Option<u64>,

    /// Give up waiting for a batch job after this many seconds
    pub max_wait_secs: Option<u64>,

    /// Cancel the batch job when the wait times out or is interrupted
    pub cancel_on_timeout: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30.0,
            max_concurrent: 8,
            build_timeout_secs: None,
            max_wait_secs: None,
            cancel_on_timeout: true,
        }
    }
}
