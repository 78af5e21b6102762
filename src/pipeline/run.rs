//! Run step: turns an instance into a batch job, submits it and waits.

use log::{debug, info, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::resolver::TestInstance;
use super::stage::StageLayout;
use crate::batch::{BatchInterface, JobInfo, JobRequest, JobStatus};
use crate::checks::RunRecipe;
use crate::config::{RunnerConfig, SchedulerKind};
use crate::errors::PipelineError;

const WAIT_SLICE: Duration = Duration::from_millis(100);

static DEPENDENCY_STAGEDIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{dependencies\.([A-Za-z0-9_\-]+)\.stagedir\}").expect("static regex")
});

/// Replace `${stagedir}` and `${dependencies.NAME.stagedir}`.
///
/// `dependency_stages` maps check names to the stage of the dependency
/// instance this instance waited for. A reference to any other check is a
/// configuration error.
pub fn substitute_stage_refs(
    text: &str,
    stage_dir: &Path,
    dependency_stages: &BTreeMap<String, PathBuf>,
) -> Result<String, PipelineError> {
    let mut missing = None;
    let replaced = DEPENDENCY_STAGEDIR.replace_all(text, |caps: &regex::Captures| {
        match dependency_stages.get(&caps[1]) {
            Some(dir) => dir.display().to_string(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                caps[0].to_string()
            }
        }
    });
    if let Some(name) = missing {
        return Err(PipelineError::Configuration(format!(
            "stage directory of dependency '{}' is not available",
            name
        )));
    }
    Ok(replaced.replace("${stagedir}", &stage_dir.display().to_string()))
}

fn substitute_each(
    items: &[String],
    stage_dir: &Path,
    dependency_stages: &BTreeMap<String, PathBuf>,
) -> Result<Vec<String>, PipelineError> {
    items
        .iter()
        .map(|item| substitute_stage_refs(item, stage_dir, dependency_stages))
        .collect()
}

/// Partition resource options requested by the run recipe. A GPU count
/// fills the partition's `gpu` resource unless the recipe sets it itself.
fn render_resources(instance: &TestInstance, run: &RunRecipe) -> Result<Vec<String>, PipelineError> {
    let mut requests = run.extra_resources.clone();
    if let Some(gpus) = run.num_gpus_per_node
        && instance.partition.get_resource("gpu").is_some()
    {
        requests
            .entry("gpu".to_string())
            .or_insert_with(|| BTreeMap::from([("num_gpus".to_string(), gpus.to_string())]));
    }
    let mut rendered = Vec::new();
    for (name, values) in &requests {
        let template = instance.partition.get_resource(name).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "partition '{}' declares no resource '{}'",
                instance.target(),
                name
            ))
        })?;
        rendered.extend(
            template
                .render(values)
                .map_err(PipelineError::Configuration)?,
        );
    }
    Ok(rendered)
}

/// Assemble the batch job of an instance
pub fn build_job_request(
    instance: &TestInstance,
    layout: &StageLayout,
    dependency_stages: &BTreeMap<String, PathBuf>,
) -> Result<JobRequest, PipelineError> {
    let run = instance.run.as_ref().ok_or_else(|| {
        PipelineError::Configuration(format!("{} has no run recipe", instance.name))
    })?;
    let stage = layout.root();
    let subst = |items: &[String]| substitute_each(items, stage, dependency_stages);

    let mut command: Vec<String> = Vec::new();
    if run.use_launcher {
        command.extend(instance.partition.launcher.prefix(run.num_tasks));
    }
    command.push(substitute_stage_refs(&run.executable, stage, dependency_stages)?);
    command.extend(subst(&run.executable_opts)?);

    let env_vars = instance
        .env_vars
        .iter()
        .map(|(k, v)| Ok((k.clone(), substitute_stage_refs(v, stage, dependency_stages)?)))
        .collect::<Result<BTreeMap<_, _>, PipelineError>>()?;

    Ok(JobRequest {
        name: instance.check.clone(),
        workdir: stage.to_path_buf(),
        script_path: layout.job_script(),
        stdout_path: layout.job_stdout(),
        stderr_path: layout.job_stderr(),
        num_tasks: run.num_tasks,
        num_tasks_per_node: run.num_tasks_per_node,
        num_gpus_per_node: run.num_gpus_per_node,
        time_limit_secs: instance.time_limit_secs,
        access: instance.partition.access.clone(),
        resources: render_resources(instance, run)?,
        job_options: subst(&run.job_options)?,
        setup_cmds: instance.modules_system.load_commands(&instance.modules),
        env_vars,
        prerun_cmds: subst(&run.prerun_cmds)?,
        command: command.join(" "),
        postrun_cmds: subst(&run.postrun_cmds)?,
    })
}

/// How long and how often to wait for a submitted job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub deadline: Option<Duration>,
    pub cancel_on_timeout: bool,
}

impl WaitPolicy {
    /// Jobs on the local scheduler are bounded by their own time limit;
    /// batch jobs are bounded by the runner's maximum wait
    pub fn for_instance(instance: &TestInstance, runner: &RunnerConfig) -> Self {
        let poll = instance
            .run
            .as_ref()
            .and_then(|r| r.poll_interval)
            .unwrap_or(runner.poll_interval);
        let deadline = match instance.partition.scheduler {
            SchedulerKind::Local => instance.time_limit_secs.or(runner.max_wait_secs),
            SchedulerKind::Pbs | SchedulerKind::Slurm => runner.max_wait_secs,
        };
        Self {
            poll_interval: Duration::from_secs_f64(poll.max(0.01)),
            deadline: deadline.map(Duration::from_secs),
            cancel_on_timeout: runner.cancel_on_timeout,
        }
    }
}

/// Poll until the job reaches a terminal state, the deadline passes or
/// `cancel` is raised
pub fn wait_for_job(
    batch: &dyn BatchInterface,
    job_id: &str,
    policy: &WaitPolicy,
    cancel: &AtomicBool,
) -> Result<JobInfo, PipelineError> {
    let start = Instant::now();
    let mut last_status = JobStatus::Unknown;
    loop {
        let info = batch
            .get_status(job_id)
            .map_err(|e| PipelineError::Job(format!("polling job {}: {:#}", job_id, e)))?;
        if info.status != last_status {
            debug!("Job {} is {}", job_id, info.status);
            last_status = info.status;
        }
        if info.status.is_terminal() {
            return Ok(info);
        }

        let next_poll = start.elapsed() + policy.poll_interval;
        while start.elapsed() < next_poll {
            let elapsed = start.elapsed();
            let timed_out = policy.deadline.is_some_and(|d| elapsed >= d);
            if timed_out || cancel.load(Ordering::SeqCst) {
                let reason = if timed_out {
                    format!(
                        "job {} still {} after {}s",
                        job_id,
                        last_status,
                        policy.deadline.map(|d| d.as_secs()).unwrap_or_default()
                    )
                } else {
                    format!("wait for job {} interrupted", job_id)
                };
                if policy.cancel_on_timeout {
                    match batch.cancel_job(job_id) {
                        Ok(0) => info!("Canceled job {}", job_id),
                        Ok(code) => warn!("Cancel of job {} exited with {}", job_id, code),
                        Err(e) => warn!("Failed to cancel job {}: {}", job_id, e),
                    }
                }
                return Err(PipelineError::RunTimeout {
                    elapsed_secs: elapsed.as_secs(),
                    reason,
                });
            }
            thread::sleep(WAIT_SLICE.min(policy.poll_interval));
        }
    }
}

/// Write the job script, submit it and wait for it to finish.
///
/// A job the scheduler killed at its wall-clock limit is a timeout. Any
/// other failed job is returned for the sanity rules to judge, unless the
/// instance has none; then the failure itself is a job error.
pub fn run_job(
    instance: &TestInstance,
    layout: &StageLayout,
    batch: &dyn BatchInterface,
    runner: &RunnerConfig,
    dependency_stages: &BTreeMap<String, PathBuf>,
    cancel: &AtomicBool,
) -> Result<JobInfo, PipelineError> {
    let request = build_job_request(instance, layout, dependency_stages)?;
    batch
        .create_submission_script(&request)
        .map_err(|e| PipelineError::Job(format!("{:#}", e)))?;
    let job_id = batch
        .submit(&request)
        .map_err(|e| PipelineError::Job(format!("{:#}", e)))?;
    info!(
        "Submitted instance={} job_id={} scheduler={}",
        instance.name,
        job_id,
        batch.kind()
    );

    let policy = WaitPolicy::for_instance(instance, runner);
    let start = Instant::now();
    let info = wait_for_job(batch, &job_id, &policy, cancel)?;
    match info.exit_code {
        Some(0) | None => debug!("Job {} finished ({})", job_id, info.status),
        Some(code) => warn!(
            "Job {} of {} exited with code {}",
            job_id, instance.name, code
        ),
    }
    match info.status {
        JobStatus::TimedOut => Err(PipelineError::RunTimeout {
            elapsed_secs: start.elapsed().as_secs(),
            reason: format!("job {} exceeded its wall-clock limit", job_id),
        }),
        JobStatus::Failed if instance.sanity.is_empty() => Err(PipelineError::Job(format!(
            "job {} failed with exit code {}",
            job_id,
            info.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ))),
        _ => Ok(info),
    }
}
