//! Slurm scheduler interface implementation

use anyhow::{Context, Result, bail};
use log::{debug, error, info, trace, warn};
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
use crate::time_utils::format_slurm_time;

/// Slurm scheduler implementation
pub struct SlurmInterface {
    sbatch_regex: Regex,
    retry_delay: Duration,
}

impl SlurmInterface {
    pub fn new() -> Result<Self> {
        Ok(Self {
            sbatch_regex: Regex::new(r"Submitted batch job (\d+)")?,
            retry_delay: Duration::from_secs(10),
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn sbatch() -> String {
        scheduler_command("HPC_REGRESS_FAKE_SBATCH", "sbatch")
    }

    fn squeue() -> String {
        scheduler_command("HPC_REGRESS_FAKE_SQUEUE", "squeue")
    }

    fn sacct() -> String {
        scheduler_command("HPC_REGRESS_FAKE_SACCT", "sacct")
    }

    fn scancel() -> String {
        scheduler_command("HPC_REGRESS_FAKE_SCANCEL", "scancel")
    }

    /// Map Slurm state to JobStatus
    fn map_status(slurm_status: &str) -> JobStatus {
        // sacct reports e.g. "CANCELLED by 1234"
        match slurm_status.split_whitespace().next().unwrap_or("") {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => JobStatus::Queued,
            "RUNNING" | "COMPLETING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Complete,
            "TIMEOUT" | "DEADLINE" => JobStatus::TimedOut,
            "FAILED" | "CANCELLED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" | "BOOT_FAIL" => {
                JobStatus::Failed
            }
            _ => JobStatus::Unknown,
        }
    }

    pub fn render_script(&self, request: &JobRequest) -> String {
        let mut script = format!(
            "#!/bin/bash\n\
             #SBATCH --job-name={}\n\
             #SBATCH --ntasks={}\n\
             #SBATCH --output={}\n\
             #SBATCH --error={}\n",
            request.name,
            request.num_tasks,
            request.stdout_path.display(),
            request.stderr_path.display()
        );
        if let Some(per_node) = request.num_tasks_per_node {
            script.push_str(&format!("#SBATCH --ntasks-per-node={}\n", per_node));
        }
        if let Some(secs) = request.time_limit_secs {
            script.push_str(&format!("#SBATCH --time={}\n", format_slurm_time(secs)));
        }
        for line in request
            .access
            .iter()
            .chain(&request.resources)
            .chain(&request.job_options)
        {
            script.push_str(&format!("#SBATCH {}\n", line));
        }
        script.push('\n');
        script.push_str(&request.script_body());
        script
    }

    /// Final state from accounting, once the job has left the queue
    fn accounting_status(&self, job_id: &str) -> Result<JobInfo> {
        let (return_code, stdout, stderr) = run_command_with_retries(
            &Self::sacct(),
            &["-j", job_id, "-n", "-X", "-P", "-o", "State,ExitCode"],
            3,
            self.retry_delay,
            &[],
        )?;
        if return_code != 0 {
            warn!("sacct failed for job {}: {}", job_id, stderr.trim());
            return Ok(JobInfo::new(job_id, JobStatus::NotFound));
        }
        let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(JobInfo::new(job_id, JobStatus::NotFound));
        };
        let mut fields = line.trim().split('|');
        let state = fields.next().unwrap_or("");
        let exit_code = fields
            .next()
            .and_then(|code| code.split(':').next())
            .and_then(|code| code.parse().ok());
        Ok(JobInfo::new(job_id, Self::map_status(state)).with_exit_code(exit_code))
    }
}

impl BatchInterface for SlurmInterface {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn create_submission_script(&self, request: &JobRequest) -> Result<()> {
        fs::write(&request.script_path, self.render_script(request)).with_context(|| {
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
        let script = request.script_path.to_string_lossy();
        let (return_code, stdout, stderr) =
            run_command_with_retries(&Self::sbatch(), &[&script], 6, self.retry_delay, &[])?;
        if return_code != 0 {
            bail!("sbatch failed with exit code {}: {}", return_code, stderr.trim());
        }
        match self.sbatch_regex.captures(&stdout).and_then(|c| c.get(1)) {
            Some(id) => {
                info!("Submitted Slurm job {} for {}", id.as_str(), request.name);
                Ok(id.as_str().to_string())
            }
            None => {
                error!("Failed to parse sbatch output: {}", stdout);
                bail!("Failed to parse job ID from sbatch output")
            }
        }
    }

    fn get_status(&self, job_id: &str) -> Result<JobInfo> {
        let (return_code, stdout, stderr) = run_command_with_retries(
            &Self::squeue(),
            &["-h", "-j", job_id, "-o", "%i %T"],
            6,
            self.retry_delay,
            &["Invalid job id specified"],
        )?;
        if return_code != 0 && !stderr.contains("Invalid job id specified") {
            bail!("squeue command failed: {} - {}", return_code, stderr.trim());
        }
        trace!("squeue output: [{}]", stdout);
        let fields: Vec<&str> = stdout.split_whitespace().collect();
        if fields.len() >= 2 && fields[0] == job_id {
            let status = Self::map_status(fields[1]);
            if !status.is_terminal() {
                return Ok(JobInfo::new(job_id, status));
            }
        }
        self.accounting_status(job_id)
    }

    fn cancel_job(&self, job_id: &str) -> Result<i32> {
        let (return_code, _, stderr) =
            run_command_with_retries(&Self::scancel(), &[job_id], 1, self.retry_delay, &[])?;
        if return_code != 0 {
            error!("Failed to cancel Slurm job {}: {}", job_id, stderr.trim());
        } else {
            info!("Canceled Slurm job {}", job_id);
        }
        Ok(return_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_render_script() {
        let slurm = SlurmInterface::new().unwrap();
        let request = JobRequest {
            name: "CM1StrongScalingTest".to_string(),
            workdir: PathBuf::from("/stage/cm1"),
            stdout_path: PathBuf::from("/stage/cm1/job.out"),
            stderr_path: PathBuf::from("/stage/cm1/job.err"),
            num_tasks: 64,
            num_tasks_per_node: Some(36),
            time_limit_secs: Some(90_000),
            access: vec!["--account=SCSG0001".to_string()],
            resources: vec!["--gres=gpu:4".to_string()],
            command: "srun ./cm1.exe".to_string(),
            ..Default::default()
        };
        let script = slurm.render_script(&request);
        assert!(script.contains("#SBATCH --ntasks=64\n"));
        assert!(script.contains("#SBATCH --ntasks-per-node=36\n"));
        assert!(script.contains("#SBATCH --time=1-01:00:00\n"));
        assert!(script.contains("#SBATCH --account=SCSG0001\n"));
        assert!(script.contains("#SBATCH --gres=gpu:4\n"));
    }

    #[test]
    fn test_map_status() {
        assert_eq!(SlurmInterface::map_status("PENDING"), JobStatus::Queued);
        assert_eq!(SlurmInterface::map_status("COMPLETED"), JobStatus::Complete);
        assert_eq!(
            SlurmInterface::map_status("CANCELLED by 1234"),
            JobStatus::Failed
        );
        assert_eq!(SlurmInterface::map_status("TIMEOUT"), JobStatus::TimedOut);
        assert_eq!(SlurmInterface::map_status("DEADLINE"), JobStatus::TimedOut);
    }
}
