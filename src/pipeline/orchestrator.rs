//! Session driver: runs every instance of an [`ExecutionPlan`].
//!
//! The main loop follows a poll/sleep shape. On each turn it fails pending
//! instances whose dependency failed, starts ready instances on worker
//! threads (bounded by `runner.max_concurrent` and each partition's
//! `max_jobs`), then waits a short slice for finished instances to report
//! back over a channel. An instance is ready once every instance it depends
//! on has passed.
//!
//! Raising the termination flag stops new instances from starting. Running
//! builds are killed, batch waits give up (canceling the job when so
//! configured) and the affected instances fail with a timeout kind.
//!
//! # Example
//!
//! ```ignore
//! use signal_hook::consts::{SIGINT, SIGTERM};
//! use signal_hook::iterator::Signals;
//!
//! let orchestrator = Orchestrator::new(plan, config.runner.clone());
//! let flag = orchestrator.get_termination_flag();
//! let mut signals = Signals::new([SIGINT, SIGTERM])?;
//! std::thread::spawn(move || {
//!     if signals.forever().next().is_some() {
//!         flag.store(true, Ordering::SeqCst);
//!     }
//! });
//! let report = orchestrator.run()?;
//! ```

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::build::run_build;
use super::plan::ExecutionPlan;
use super::resolver::TestInstance;
use super::run::run_job;
use super::stage::StageLayout;
use crate::batch::{BatchInterface, create_batch_interface};
use crate::config::{RunnerConfig, SchedulerKind};
use crate::errors::PipelineError;
use crate::report::{InstanceReport, RunReport, new_session_id};
use crate::validate::evaluate_output;

const RECV_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Pending,
    Running,
    Passed,
    Failed,
}

/// Everything a worker thread needs besides the instance itself
#[derive(Clone)]
pub struct WorkerContext {
    pub runner: RunnerConfig,
    pub batch: Arc<dyn BatchInterface>,
    pub cancel: Arc<AtomicBool>,
    /// Stage directories of the instance's dependencies, by check name
    pub dependency_stages: BTreeMap<String, PathBuf>,
}

struct RunningInstance {
    partition: String,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    plan: ExecutionPlan,
    runner: RunnerConfig,
    session_id: String,
    batches: HashMap<SchedulerKind, Arc<dyn BatchInterface>>,
    termination_requested: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(plan: ExecutionPlan, runner: RunnerConfig) -> Self {
        Self {
            plan,
            runner,
            session_id: new_session_id(),
            batches: HashMap::new(),
            termination_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    /// Use `batch` for every partition on scheduler `kind` instead of the
    /// default backend
    pub fn with_batch_interface(
        mut self,
        kind: SchedulerKind,
        batch: Arc<dyn BatchInterface>,
    ) -> Self {
        self.batches.insert(kind, batch);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Shared flag a signal handler can raise to stop the session
    pub fn get_termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.termination_requested)
    }

    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    pub fn request_termination(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
    }

    fn batch_for(
        &mut self,
        kind: SchedulerKind,
    ) -> Result<Arc<dyn BatchInterface>, PipelineError> {
        if let Some(batch) = self.batches.get(&kind) {
            return Ok(Arc::clone(batch));
        }
        let batch = create_batch_interface(kind)
            .map_err(|e| PipelineError::Job(format!("{} backend unavailable: {:#}", kind, e)))?;
        self.batches.insert(kind, Arc::clone(&batch));
        Ok(batch)
    }

    fn dependency_stages(&self, name: &str) -> BTreeMap<String, PathBuf> {
        let mut stages = BTreeMap::new();
        if let Some(deps) = self.plan.graph.dependencies_of(name) {
            for dep in deps {
                if let Some(instance) = self.plan.get(dep) {
                    stages.insert(instance.check.clone(), instance.stage_dir.clone());
                }
            }
        }
        stages
    }

    /// Run the whole plan and return the finished session report
    pub fn run(mut self) -> Result<RunReport> {
        let order = self.plan.graph.topological_order()?;
        let mut report = RunReport::new(&self.session_id, &self.plan.system);
        info!(
            "Starting session session_id={} system={} instances={} max_concurrent={}",
            self.session_id,
            self.plan.system,
            order.len(),
            self.runner.max_concurrent
        );
        for (check, err) in &self.plan.rejected {
            warn!("Rejected check={}: {}", check, err);
            report.push(InstanceReport::rejected(check, &self.plan.system, err));
        }

        let mut states: HashMap<String, InstanceState> = order
            .iter()
            .map(|name| (name.clone(), InstanceState::Pending))
            .collect();
        let mut results: HashMap<String, InstanceReport> = HashMap::new();

        for unresolved in &self.plan.unresolved {
            if let Some(instance) = self.plan.get(&unresolved.instance) {
                let mut failed = InstanceReport::new(instance);
                failed.fail(&unresolved.error);
                warn!("Not running {}: {}", instance.name, unresolved.error);
                states.insert(instance.name.clone(), InstanceState::Failed);
                results.insert(instance.name.clone(), failed);
            }
        }

        let (tx, rx) = mpsc::channel::<InstanceReport>();
        let mut running: HashMap<String, RunningInstance> = HashMap::new();
        let mut partition_load: HashMap<String, u32> = HashMap::new();
        let max_concurrent = self.runner.max_concurrent.max(1);

        loop {
            // Topological order lets a failure cascade through a whole
            // chain of dependents in one pass
            for name in &order {
                if states.get(name) != Some(&InstanceState::Pending) {
                    continue;
                }
                let failed_dep = self.plan.graph.dependencies_of(name).and_then(|deps| {
                    let mut deps: Vec<&String> = deps.iter().collect();
                    deps.sort();
                    deps.into_iter()
                        .find(|d| states.get(*d) == Some(&InstanceState::Failed))
                        .cloned()
                });
                if let Some(dependency) = failed_dep
                    && let Some(instance) = self.plan.get(name)
                {
                    info!("Skipping {}: dependency {} failed", name, dependency);
                    let mut skipped = InstanceReport::new(instance);
                    skipped.fail(&PipelineError::DependencyFailed { dependency });
                    states.insert(name.clone(), InstanceState::Failed);
                    results.insert(name.clone(), skipped);
                }
            }

            if self.is_termination_requested() {
                for name in &order {
                    if states.get(name) != Some(&InstanceState::Pending) {
                        continue;
                    }
                    if let Some(instance) = self.plan.get(name) {
                        let mut skipped = InstanceReport::new(instance);
                        skipped.fail(&PipelineError::RunTimeout {
                            elapsed_secs: 0,
                            reason: "session interrupted before the instance started".to_string(),
                        });
                        states.insert(name.clone(), InstanceState::Failed);
                        results.insert(name.clone(), skipped);
                    }
                }
            } else {
                for name in &order {
                    if running.len() >= max_concurrent {
                        break;
                    }
                    if states.get(name) != Some(&InstanceState::Pending) {
                        continue;
                    }
                    let ready = self.plan.graph.dependencies_of(name).is_none_or(|deps| {
                        deps.iter()
                            .all(|d| states.get(d) == Some(&InstanceState::Passed))
                    });
                    if !ready {
                        continue;
                    }
                    let Some(instance) = self.plan.get(name).cloned() else {
                        continue;
                    };
                    let partition = instance.partition.name.clone();
                    let load = partition_load.get(&partition).copied().unwrap_or(0);
                    if load >= instance.partition.max_jobs.max(1) {
                        debug!(
                            "Partition {} at max_jobs ({}); {} waits",
                            partition, instance.partition.max_jobs, name
                        );
                        continue;
                    }

                    let batch = match self.batch_for(instance.partition.scheduler) {
                        Ok(batch) => batch,
                        Err(e) => {
                            error!("Cannot start {}: {}", name, e);
                            let mut failed = InstanceReport::new(&instance);
                            failed.fail(&e);
                            states.insert(name.clone(), InstanceState::Failed);
                            results.insert(name.clone(), failed);
                            continue;
                        }
                    };
                    let ctx = WorkerContext {
                        runner: self.runner.clone(),
                        batch,
                        cancel: self.get_termination_flag(),
                        dependency_stages: self.dependency_stages(name),
                    };
                    let worker_tx = tx.clone();
                    let handle = thread::spawn(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            execute_instance(&instance, &ctx)
                        }))
                        .unwrap_or_else(|_| {
                            let mut failed = InstanceReport::new(&instance);
                            failed.fail(&PipelineError::Job("worker thread panicked".to_string()));
                            failed
                        });
                        if worker_tx.send(result).is_err() {
                            warn!("Session ended before {} reported", instance.name);
                        }
                    });
                    states.insert(name.clone(), InstanceState::Running);
                    *partition_load.entry(partition.clone()).or_insert(0) += 1;
                    running.insert(name.clone(), RunningInstance { partition, handle });
                }
            }

            if running.is_empty() {
                let stuck: Vec<String> = order
                    .iter()
                    .filter(|n| states.get(*n) == Some(&InstanceState::Pending))
                    .cloned()
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                // Nothing running and nothing startable: only possible when
                // a dependency never reached a terminal state
                for name in stuck {
                    if let Some(instance) = self.plan.get(&name) {
                        let mut failed = InstanceReport::new(instance);
                        failed.fail(&PipelineError::Configuration(
                            "instance could not be scheduled".to_string(),
                        ));
                        states.insert(name.clone(), InstanceState::Failed);
                        results.insert(name, failed);
                    }
                }
                continue;
            }

            let mut finished = Vec::new();
            match rx.recv_timeout(RECV_SLICE) {
                Ok(result) => finished.push(result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("worker channel closed unexpectedly");
                }
            }
            finished.extend(rx.try_iter());

            for result in finished {
                let name = result.name.clone();
                if let Some(done) = running.remove(&name) {
                    if let Some(load) = partition_load.get_mut(&done.partition) {
                        *load = load.saturating_sub(1);
                    }
                    if done.handle.join().is_err() {
                        warn!("Worker for {} did not exit cleanly", name);
                    }
                }
                let state = if result.passed() {
                    info!("PASSED {}", name);
                    InstanceState::Passed
                } else {
                    match &result.failure {
                        Some(f) => info!("FAILED {} ({}: {})", name, f.kind, f.message),
                        None => info!("FAILED {}", name),
                    }
                    InstanceState::Failed
                };
                states.insert(name.clone(), state);
                results.insert(name, result);
            }
        }

        for name in &order {
            if let Some(result) = results.remove(name) {
                report.push(result);
            }
        }
        report.finish();
        info!(
            "Session finished session_id={} total={} passed={} failed={}",
            report.session_id, report.summary.total, report.summary.passed, report.summary.failed
        );
        Ok(report)
    }
}

/// Run one instance through stage, build, run and evaluation. Never
/// panics on pipeline errors; they end up in the returned report.
pub fn execute_instance(instance: &TestInstance, ctx: &WorkerContext) -> InstanceReport {
    let mut report = InstanceReport::new(instance);
    report.started_at = Some(Utc::now());
    let start = Instant::now();
    debug!(
        "Starting instance={} partition={} environ={}",
        instance.name, instance.partition.name, instance.environ.name
    );
    if let Err(e) = run_pipeline(instance, ctx, &mut report) {
        report.fail(&e);
    }
    report.duration_secs = start.elapsed().as_secs_f64();
    report
}

fn run_pipeline(
    instance: &TestInstance,
    ctx: &WorkerContext,
    report: &mut InstanceReport,
) -> Result<(), PipelineError> {
    let layout = StageLayout::new(&instance.stage_dir);
    layout.prepare(instance.sourcesdir.as_deref())?;

    if let Some(recipe) = &instance.build {
        let timeout = ctx.runner.build_timeout_secs.map(Duration::from_secs);
        let outcome = run_build(instance, recipe, &layout, timeout, &ctx.cancel)?;
        debug!(
            "Built {} in {:.1}s",
            instance.name,
            outcome.duration.as_secs_f64()
        );
    }

    let output = match &instance.run {
        Some(_) => {
            let info = run_job(
                instance,
                &layout,
                ctx.batch.as_ref(),
                &ctx.runner,
                &ctx.dependency_stages,
                &ctx.cancel,
            )?;
            report.job_id = Some(info.job_id);
            report.exit_code = info.exit_code;
            layout.captured_output()
        }
        None => layout.captured_build_output(),
    };

    let evaluation = evaluate_output(
        &instance.sanity,
        &instance.performance,
        &output,
        &instance.numeric_parameters,
        &instance.references,
    );
    report.record_evaluation(evaluation);
    Ok(())
}
