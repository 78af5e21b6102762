use anyhow::Result;

use super::common::{JobInfo, JobRequest};
use crate::config::SchedulerKind;

/// A batch scheduler the run executor can submit to and poll
pub trait BatchInterface: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Write the job script to `request.script_path`
    fn create_submission_script(&self, request: &JobRequest) -> Result<()>;

    /// Submit a written job script and return the scheduler's job id
    fn submit(&self, request: &JobRequest) -> Result<String>;

    fn get_status(&self, job_id: &str) -> Result<JobInfo>;

    /// Best-effort cancellation; returns the cancel command's exit code
    fn cancel_job(&self, job_id: &str) -> Result<i32>;
}
