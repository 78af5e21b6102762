//! Types shared by the scheduler backends

use anyhow::Result;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Scheduler-neutral job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    /// Killed by the scheduler at its wall-clock limit
    TimedOut,
    /// The scheduler no longer knows the job
    NotFound,
    Unknown,
}

impl JobStatus {
    /// True once the job will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::TimedOut | JobStatus::NotFound
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed out",
            JobStatus::NotFound => "not found",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

impl JobInfo {
    pub fn new(job_id: &str, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Everything needed to write and submit one job script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRequest {
    pub name: String,
    /// Working directory of the job
    pub workdir: PathBuf,
    pub script_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub num_tasks: u32,
    pub num_tasks_per_node: Option<u32>,
    pub num_gpus_per_node: Option<u32>,
    pub time_limit_secs: Option<u64>,
    /// Partition access arguments (`-A ACCOUNT`, `-q queue`)
    pub access: Vec<String>,
    /// Rendered partition resource options (`:ngpus=4`)
    pub resources: Vec<String>,
    /// Check-supplied scheduler options
    pub job_options: Vec<String>,
    /// Shell lines run before the pre-run steps (module loads)
    pub setup_cmds: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub prerun_cmds: Vec<String>,
    /// Full launch line, launcher prefix included
    pub command: String,
    pub postrun_cmds: Vec<String>,
}

/// Single-quote `value` unless it is a plain word
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Double quotes keep `$VAR` references expandable
pub fn env_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| !c.is_whitespace() && !"\"'`;&|<>()".contains(c)) {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

impl JobRequest {
    /// Node count implied by the task layout
    pub fn num_nodes(&self) -> u32 {
        match self.num_tasks_per_node {
            Some(per_node) if per_node > 0 => self.num_tasks.div_ceil(per_node).max(1),
            _ => 1,
        }
    }

    /// Script body after the scheduler directives
    pub fn script_body(&self) -> String {
        let mut body = String::new();
        body.push_str(&format!("cd {}\n", shell_quote(&self.workdir.to_string_lossy())));
        for cmd in &self.setup_cmds {
            body.push_str(cmd);
            body.push('\n');
        }
        for (key, value) in &self.env_vars {
            body.push_str(&format!("export {}={}\n", key, env_quote(value)));
        }
        for cmd in &self.prerun_cmds {
            body.push_str(cmd);
            body.push('\n');
        }
        body.push_str(&self.command);
        body.push('\n');
        for cmd in &self.postrun_cmds {
            body.push_str(cmd);
            body.push('\n');
        }
        body
    }
}

/// Run a command with retries for transient errors.
///
/// Returns `(exit code, stdout, stderr)` of the last attempt. Output that
/// contains one of `ignore_errors` counts as final.
pub fn run_command_with_retries(
    cmd: &str,
    args: &[&str],
    num_retries: usize,
    retry_delay: Duration,
    ignore_errors: &[&str],
) -> Result<(i32, String, String)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        trace!("Running command: {} {:?} (attempt {})", cmd, args, attempts);

        let output = Command::new(cmd).args(args).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let return_code = output.status.code().unwrap_or(-1);

        let should_ignore = ignore_errors
            .iter()
            .any(|err| stderr.contains(err) || stdout.contains(err));

        if return_code == 0 || should_ignore || attempts >= num_retries {
            return Ok((return_code, stdout, stderr));
        }

        warn!(
            "Command failed (attempt {}/{}): {} - {}",
            attempts,
            num_retries,
            return_code,
            stderr.trim()
        );
        thread::sleep(retry_delay);
    }
}

/// Scheduler command, overridable through `var` for testing with fake
/// executables
pub fn scheduler_command(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}
