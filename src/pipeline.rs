//! Test pipeline: resolution, dependency ordering, build, run and session
//! orchestration.
//!
//! A [`TestDefinition`](crate::checks::TestDefinition) is resolved into
//! [`TestInstance`]s for the current system. The instances and their
//! dependency edges form an [`ExecutionPlan`], which the [`Orchestrator`]
//! executes: every instance is staged, built, run through the batch layer
//! and evaluated, in an order that respects its dependencies.

pub mod build;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod resolver;
pub mod run;
pub mod stage;

pub use build::{BuildOutcome, build_commands, render_build_script, run_build};
pub use graph::{DependencyGraph, UnresolvedDependency};
pub use orchestrator::{Orchestrator, WorkerContext, execute_instance};
pub use plan::ExecutionPlan;
pub use resolver::{Resolution, Resolver, TestInstance, instance_name};
pub use run::{WaitPolicy, build_job_request, run_job, substitute_stage_refs, wait_for_job};
pub use stage::{StageLayout, copy_dir_recursive};
