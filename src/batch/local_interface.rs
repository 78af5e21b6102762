//! Runs job scripts as child processes of the current host.
//!
//! Each job runs in its own process group so that canceling it also stops
//! whatever the script started.

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use super::batch_interface::BatchInterface;
use super::common::{JobInfo, JobRequest, JobStatus};
use crate::config::SchedulerKind;

/// Jobs are forgotten once their final state has been reported
#[derive(Default)]
pub struct LocalInterface {
    running: Mutex<HashMap<String, Child>>,
}

impl LocalInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_script(&self, request: &JobRequest) -> String {
        format!("#!/bin/bash\n\n{}", request.script_body())
    }
}

impl BatchInterface for LocalInterface {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Local
    }

    fn create_submission_script(&self, request: &JobRequest) -> Result<()> {
        fs::write(&request.script_path, self.render_script(request)).with_context(|| {
            format!("Failed to write job script to {:?}", request.script_path)
        })?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&request.script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&request.script_path, perms)?;
        }
        debug!("Created job script: {:?}", request.script_path);
        Ok(())
    }

    fn submit(&self, request: &JobRequest) -> Result<String> {
        let stdout = File::create(&request.stdout_path)
            .with_context(|| format!("Failed to create {:?}", request.stdout_path))?;
        let stderr = File::create(&request.stderr_path)
            .with_context(|| format!("Failed to create {:?}", request.stderr_path))?;
        let mut command = Command::new("bash");
        command
            .arg(&request.script_path)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .with_context(|| format!("Failed to start {:?}", request.script_path))?;
        let job_id = child.id().to_string();
        info!("Started local job {} for {}", job_id, request.name);
        self.running
            .lock()
            .map_err(|_| anyhow!("local job table poisoned"))?
            .insert(job_id.clone(), child);
        Ok(job_id)
    }

    fn get_status(&self, job_id: &str) -> Result<JobInfo> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("local job table poisoned"))?;
        let Some(child) = running.get_mut(job_id) else {
            return Ok(JobInfo::new(job_id, JobStatus::NotFound));
        };
        match child.try_wait()? {
            None => Ok(JobInfo::new(job_id, JobStatus::Running)),
            Some(status) => {
                running.remove(job_id);
                Ok(finished_info(job_id, status.code()))
            }
        }
    }

    fn cancel_job(&self, job_id: &str) -> Result<i32> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("local job table poisoned"))?;
        match running.get_mut(job_id) {
            Some(child) => {
                kill_process_group(job_id);
                if let Err(e) = child.kill() {
                    // The wrapper may be gone already
                    debug!("Kill of local job {} wrapper: {}", job_id, e);
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap local job {}: {}", job_id, e);
                    return Ok(1);
                }
                running.remove(job_id);
                info!("Killed local job {}", job_id);
                Ok(0)
            }
            None => Ok(0),
        }
    }
}

/// The job's pid doubles as its process group id
#[cfg(unix)]
fn kill_process_group(job_id: &str) {
    let group = format!("-{}", job_id);
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!("Killed process group {}", job_id),
        Ok(status) => debug!("kill of process group {} exited with {}", job_id, status),
        Err(e) => warn!("Failed to run kill for process group {}: {}", job_id, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_job_id: &str) {}

fn finished_info(job_id: &str, code: Option<i32>) -> JobInfo {
    let status = match code {
        Some(0) => JobStatus::Complete,
        _ => JobStatus::Failed,
    };
    JobInfo::new(job_id, status).with_exit_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn request(dir: &std::path::Path, command: &str) -> JobRequest {
        JobRequest {
            name: "local".to_string(),
            workdir: dir.to_path_buf(),
            script_path: dir.join("job.sh"),
            stdout_path: dir.join("job.out"),
            stderr_path: dir.join("job.err"),
            num_tasks: 1,
            command: command.to_string(),
            ..Default::default()
        }
    }

    fn wait(local: &LocalInterface, job_id: &str) -> JobInfo {
        for _ in 0..200 {
            let info = local.get_status(job_id).unwrap();
            if info.status.is_terminal() {
                return info;
            }
            thread::sleep(Duration::from_millis(25));
        }
        panic!("job {} did not finish", job_id);
    }

    #[test]
    fn test_run_and_capture() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalInterface::new();
        let req = request(dir.path(), "echo 'Hello, World!'; echo oops >&2");
        local.create_submission_script(&req).unwrap();
        let id = local.submit(&req).unwrap();
        let info = wait(&local, &id);
        assert_eq!(info.status, JobStatus::Complete);
        assert_eq!(info.exit_code, Some(0));
        assert_eq!(fs::read_to_string(&req.stdout_path).unwrap(), "Hello, World!\n");
        assert_eq!(fs::read_to_string(&req.stderr_path).unwrap(), "oops\n");
    }

    #[test]
    fn test_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalInterface::new();
        let req = request(dir.path(), "exit 3");
        local.create_submission_script(&req).unwrap();
        let id = local.submit(&req).unwrap();
        let info = wait(&local, &id);
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.exit_code, Some(3));
    }

    #[test]
    fn test_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalInterface::new();
        let req = request(dir.path(), "sleep 30");
        local.create_submission_script(&req).unwrap();
        let id = local.submit(&req).unwrap();
        assert_eq!(local.cancel_job(&id).unwrap(), 0);
        assert_eq!(local.get_status(&id).unwrap().status, JobStatus::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_stops_processes_started_by_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalInterface::new();
        let req = request(dir.path(), "bash -c 'sleep 1; echo survived > marker.txt'");
        local.create_submission_script(&req).unwrap();
        let id = local.submit(&req).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(local.cancel_job(&id).unwrap(), 0);
        thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("marker.txt").exists());
    }

    #[test]
    fn test_finished_job_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalInterface::new();
        let req = request(dir.path(), "true");
        local.create_submission_script(&req).unwrap();
        let id = local.submit(&req).unwrap();
        assert_eq!(wait(&local, &id).status, JobStatus::Complete);
        assert_eq!(local.get_status(&id).unwrap().status, JobStatus::NotFound);
    }
}
