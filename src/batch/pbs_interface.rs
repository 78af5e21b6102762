//! PBS Pro scheduler interface (`qsub`, `qstat`, `qdel`)

use anyhow::{Context, Result, bail};
use log::{debug, error, info, trace};
use regex::Regex;
use std::fs;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::batch_interface::BatchInterface;
use super::common::{
    JobInfo, JobRequest, JobStatus, run_command_with_retries, scheduler_command,
};
use crate::config::SchedulerKind;
use crate::time_utils::{duration_string_to_seconds, format_hms};

/// `JOB_EXEC_KILL_WALLTIME`
const EXIT_KILLED_WALLTIME: i32 = -29;
/// 256 + SIGTERM, as left by a walltime kill or `qdel`
const EXIT_SIGTERM: i32 = 271;

pub struct PbsInterface {
    job_id_regex: Regex,
    state_regex: Regex,
    exit_regex: Regex,
    walltime_used_regex: Regex,
    walltime_limit_regex: Regex,
    retry_delay: Duration,
}

impl PbsInterface {
    pub fn new() -> Result<Self> {
        Ok(Self {
            job_id_regex: Regex::new(r"^\s*(\d+(?:\[\d*\])?(?:\.\S+)?)\s*$")?,
            state_regex: Regex::new(r"(?m)^\s*job_state\s*=\s*(\S+)")?,
            exit_regex: Regex::new(r"(?m)^\s*Exit_status\s*=\s*(-?\d+)")?,
            walltime_used_regex: Regex::new(r"(?m)^\s*resources_used\.walltime\s*=\s*(\S+)")?,
            walltime_limit_regex: Regex::new(r"(?m)^\s*Resource_List\.walltime\s*=\s*(\S+)")?,
            retry_delay: Duration::from_secs(10),
        })
    }

    /// Shorter pause between retries (tests)
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn qsub() -> String {
        scheduler_command("HPC_REGRESS_FAKE_QSUB", "qsub")
    }

    fn qstat() -> String {
        scheduler_command("HPC_REGRESS_FAKE_QSTAT", "qstat")
    }

    fn qdel() -> String {
        scheduler_command("HPC_REGRESS_FAKE_QDEL", "qdel")
    }

    /// Whether a finished job was killed at its walltime limit. Exit 271
    /// counts only when the used walltime reached the requested one, since
    /// `qdel` leaves the same status.
    fn hit_walltime(&self, qstat_output: &str, exit_code: i32) -> bool {
        match exit_code {
            EXIT_KILLED_WALLTIME => true,
            EXIT_SIGTERM => {
                let seconds = |regex: &Regex| {
                    regex
                        .captures(qstat_output)
                        .and_then(|c| duration_string_to_seconds(&c[1]).ok())
                };
                match (
                    seconds(&self.walltime_used_regex),
                    seconds(&self.walltime_limit_regex),
                ) {
                    (Some(used), Some(limit)) => used >= limit,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn map_state(state: &str) -> JobStatus {
        match state {
            "Q" | "H" | "W" | "T" | "S" | "U" => JobStatus::Queued,
            "R" | "E" | "B" => JobStatus::Running,
            "F" | "X" => JobStatus::Complete,
            _ => JobStatus::Unknown,
        }
    }

    /// Render the `#PBS` header.
    ///
    /// Options starting with `-` become their own directive; bare options
    /// (`gpu_type=a100`) and partition resources (`:ngpus=4`) extend the
    /// `select` statement.
    pub fn render_script(&self, request: &JobRequest) -> String {
        let per_node = request.num_tasks_per_node.unwrap_or(request.num_tasks);
        let mut select = format!(
            "select={}:mpiprocs={}:ncpus={}",
            request.num_nodes(),
            per_node,
            per_node
        );
        for resource in &request.resources {
            if resource.starts_with(':') {
                select.push_str(resource);
            } else {
                select.push(':');
                select.push_str(resource);
            }
        }
        let mut directives = Vec::new();
        for option in &request.job_options {
            if option.starts_with('-') {
                directives.push(format!("#PBS {}", option));
            } else {
                select.push(':');
                select.push_str(option.trim_start_matches(':'));
            }
        }

        let mut script = format!(
            "#!/bin/bash\n\
             #PBS -N {}\n\
             #PBS -l {}\n",
            request.name, select
        );
        if let Some(secs) = request.time_limit_secs {
            script.push_str(&format!("#PBS -l walltime={}\n", format_hms(secs)));
        }
        script.push_str(&format!("#PBS -o {}\n", request.stdout_path.display()));
        script.push_str(&format!("#PBS -e {}\n", request.stderr_path.display()));
        for access in &request.access {
            script.push_str(&format!("#PBS {}\n", access));
        }
        for directive in directives {
            script.push_str(&directive);
            script.push('\n');
        }
        script.push('\n');
        script.push_str(&request.script_body());
        script
    }
}

impl BatchInterface for PbsInterface {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pbs
    }

    fn create_submission_script(&self, request: &JobRequest) -> Result<()> {
        let script = self.render_script(request);
        fs::write(&request.script_path, script).with_context(|| {
            format!(
                "Failed to write submission script to {:?}",
                request.script_path
            )
        })?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&request.script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&request.script_path, perms)?;
        }
        debug!("Created submission script: {:?}", request.script_path);
        Ok(())
    }

    fn submit(&self, request: &JobRequest) -> Result<String> {
        let qsub = Self::qsub();
        let script = request.script_path.to_string_lossy();
        let (return_code, stdout, stderr) =
            run_command_with_retries(&qsub, &[&script], 3, self.retry_delay, &[])?;
        if return_code != 0 {
            bail!("qsub failed with exit code {}: {}", return_code, stderr.trim());
        }
        let last_line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        match self.job_id_regex.captures(last_line).and_then(|c| c.get(1)) {
            Some(id) => {
                info!("Submitted PBS job {} for {}", id.as_str(), request.name);
                Ok(id.as_str().to_string())
            }
            None => {
                error!("Failed to parse qsub output: {}", stdout);
                bail!("Failed to parse job ID from qsub output")
            }
        }
    }

    fn get_status(&self, job_id: &str) -> Result<JobInfo> {
        let qstat = Self::qstat();
        let (return_code, stdout, stderr) = run_command_with_retries(
            &qstat,
            &["-fx", job_id],
            3,
            self.retry_delay,
            &["Unknown Job Id", "Job has finished"],
        )?;
        trace!("qstat output: [{}]", stdout);
        if return_code != 0 {
            if stderr.contains("Unknown Job Id") || stderr.contains("Job has finished") {
                return Ok(JobInfo::new(job_id, JobStatus::NotFound));
            }
            bail!("qstat command failed: {} - {}", return_code, stderr.trim());
        }
        let status = self
            .state_regex
            .captures(&stdout)
            .map(|c| Self::map_state(&c[1]))
            .unwrap_or(JobStatus::NotFound);
        let exit_code = self
            .exit_regex
            .captures(&stdout)
            .and_then(|c| c[1].parse().ok());
        let status = match (status, exit_code) {
            (JobStatus::Complete, Some(code)) if self.hit_walltime(&stdout, code) => {
                JobStatus::TimedOut
            }
            (JobStatus::Complete, Some(code)) if code != 0 => JobStatus::Failed,
            (status, _) => status,
        };
        Ok(JobInfo::new(job_id, status).with_exit_code(exit_code))
    }

    fn cancel_job(&self, job_id: &str) -> Result<i32> {
        let (return_code, _, stderr) =
            run_command_with_retries(&Self::qdel(), &[job_id], 1, self.retry_delay, &[])?;
        if return_code != 0 {
            error!("Failed to cancel PBS job {}: {}", job_id, stderr.trim());
        } else {
            info!("Canceled PBS job {}", job_id);
        }
        Ok(return_code)
    }
}
