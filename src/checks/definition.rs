//! Resolved test definitions.
//!
//! A [`TestDefinition`] is what a suite entry becomes once its defaults and
//! overrides have been merged and checked. It is immutable from then on; the
//! resolver turns it into one [`crate::pipeline::TestInstance`] per
//! applicable partition, environment and parameter combination.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::parameters::{Combination, ParameterMode, ParameterSpec, expand_parameters};
use crate::time_utils::duration_string_to_seconds;
use crate::validate::{PerformanceRule, ReferenceTable, SanityRule};

/// Compiler and linker flags for one environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlagSet {
    pub cppflags: Vec<String>,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub fflags: Vec<String>,
    pub ldflags: Vec<String>,
    /// Extra arguments appended to the build tool command line
    pub options: Vec<String>,
}

impl FlagSet {
    pub fn is_empty(&self) -> bool {
        self.cppflags.is_empty()
            && self.cflags.is_empty()
            && self.cxxflags.is_empty()
            && self.fflags.is_empty()
            && self.ldflags.is_empty()
            && self.options.is_empty()
    }

    /// `self` followed by `other`, list by list
    pub fn merged(&self, other: &FlagSet) -> FlagSet {
        let cat = |a: &[String], b: &[String]| a.iter().chain(b).cloned().collect::<Vec<_>>();
        FlagSet {
            cppflags: cat(&self.cppflags, &other.cppflags),
            cflags: cat(&self.cflags, &other.cflags),
            cxxflags: cat(&self.cxxflags, &other.cxxflags),
            fflags: cat(&self.fflags, &other.fflags),
            ldflags: cat(&self.ldflags, &other.ldflags),
            options: cat(&self.options, &other.options),
        }
    }
}

/// How the build step produces the executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSystem {
    /// `make -j N [-f makefile] CC=.. FLAGS=.. options`
    Make {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        makefile: Option<String>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
    /// Compile one source file with the compiler matching its extension
    SingleSource {
        sourcepath: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executable: Option<String>,
    },
    /// Run the listed commands verbatim
    Custom { commands: Vec<String> },
}

impl BuildSystem {
    pub fn name(&self) -> &'static str {
        match self {
            BuildSystem::Make { .. } => "make",
            BuildSystem::SingleSource { .. } => "single_source",
            BuildSystem::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecipe {
    pub build_system: BuildSystem,
    pub prebuild_cmds: Vec<String>,
    pub postbuild_cmds: Vec<String>,
    /// Applied in every environment
    pub flags: FlagSet,
    /// Keyed by environment name; looked up by exact match
    pub environ_flags: BTreeMap<String, FlagSet>,
}

impl BuildRecipe {
    /// Common flags followed by the environment's own; an environment with
    /// no entry adds nothing
    pub fn flags_for(&self, environ: &str) -> FlagSet {
        match self.environ_flags.get(environ) {
            Some(extra) => self.flags.merged(extra),
            None => self.flags.clone(),
        }
    }
}

/// Wall-clock limit chosen by task count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLimitStep {
    pub max_tasks: u32,
    pub time_limit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecipe {
    pub executable: String,
    pub executable_opts: Vec<String>,
    pub prerun_cmds: Vec<String>,
    pub postrun_cmds: Vec<String>,
    pub num_tasks: u32,
    pub num_tasks_per_node: Option<u32>,
    pub num_gpus_per_node: Option<u32>,
    pub time_limit: Option<String>,
    /// First step whose `max_tasks` covers the task count wins
    pub time_limit_steps: Vec<TimeLimitStep>,
    /// Partition resource name to template values
    pub extra_resources: BTreeMap<String, BTreeMap<String, String>>,
    /// Raw scheduler options
    pub job_options: Vec<String>,
    pub poll_interval: Option<f64>,
    /// Prefix the executable with the partition launcher
    pub use_launcher: bool,
}

impl RunRecipe {
    /// Effective time limit in seconds for `num_tasks`
    pub fn time_limit_secs(&self, num_tasks: u32) -> Result<Option<u64>, String> {
        let chosen = self
            .time_limit_steps
            .iter()
            .find(|step| num_tasks <= step.max_tasks)
            .map(|step| step.time_limit.as_str())
            .or(self.time_limit.as_deref());
        chosen.map(duration_string_to_seconds).transpose()
    }
}

/// Sweep axes of a parameterized check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub mode: ParameterMode,
}

impl Sweep {
    pub fn combinations(&self) -> Result<Vec<Combination>, String> {
        expand_parameters(&self.parameters, self.mode)
    }
}

/// What a check does, as a tagged variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TestShape {
    CompileOnly {
        build: BuildRecipe,
    },
    RunOnly {
        run: RunRecipe,
    },
    CompileAndRun {
        build: BuildRecipe,
        run: RunRecipe,
    },
    ParameterSweep {
        sweep: Sweep,
        template: Box<TestShape>,
    },
}

impl TestShape {
    pub fn name(&self) -> &'static str {
        match self {
            TestShape::CompileOnly { .. } => "compile_only",
            TestShape::RunOnly { .. } => "run_only",
            TestShape::CompileAndRun { .. } => "compile_and_run",
            TestShape::ParameterSweep { .. } => "parameter_sweep",
        }
    }

    pub fn build(&self) -> Option<&BuildRecipe> {
        match self {
            TestShape::CompileOnly { build } | TestShape::CompileAndRun { build, .. } => {
                Some(build)
            }
            TestShape::RunOnly { .. } => None,
            TestShape::ParameterSweep { template, .. } => template.build(),
        }
    }

    pub fn run(&self) -> Option<&RunRecipe> {
        match self {
            TestShape::RunOnly { run } | TestShape::CompileAndRun { run, .. } => Some(run),
            TestShape::CompileOnly { .. } => None,
            TestShape::ParameterSweep { template, .. } => template.run(),
        }
    }

    pub fn sweep(&self) -> Option<&Sweep> {
        match self {
            TestShape::ParameterSweep { sweep, .. } => Some(sweep),
            _ => None,
        }
    }
}

/// A fully merged, validated check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    pub descr: String,
    pub tags: BTreeSet<String>,
    pub valid_systems: Vec<String>,
    pub valid_prog_environs: Vec<String>,
    pub sourcesdir: Option<PathBuf>,
    pub variables: BTreeMap<String, String>,
    pub modules: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub shape: TestShape,
    pub sanity: Vec<SanityRule>,
    pub performance: Vec<PerformanceRule>,
    pub references: ReferenceTable,
    /// Suite the check came from
    pub suite: String,
}

impl TestDefinition {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Parameter combinations; a check without a sweep has exactly one,
    /// empty combination
    pub fn combinations(&self) -> Result<Vec<Combination>, String> {
        match self.shape.sweep() {
            Some(sweep) => sweep.combinations(),
            None => Ok(vec![Combination::new()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_recipe() -> RunRecipe {
        RunRecipe {
            executable: "./cm1.exe".to_string(),
            executable_opts: vec![],
            prerun_cmds: vec![],
            postrun_cmds: vec![],
            num_tasks: 4,
            num_tasks_per_node: Some(36),
            num_gpus_per_node: None,
            time_limit: Some("2h".to_string()),
            time_limit_steps: vec![
                TimeLimitStep {
                    max_tasks: 8,
                    time_limit: "2h".to_string(),
                },
                TimeLimitStep {
                    max_tasks: 32,
                    time_limit: "1h".to_string(),
                },
            ],
            extra_resources: BTreeMap::new(),
            job_options: vec![],
            poll_interval: None,
            use_launcher: true,
        }
    }

    #[test]
    fn test_time_limit_steps() {
        let run = run_recipe();
        assert_eq!(run.time_limit_secs(4).unwrap(), Some(7200));
        assert_eq!(run.time_limit_secs(16).unwrap(), Some(3600));
        // Beyond every step: the plain limit
        assert_eq!(run.time_limit_secs(64).unwrap(), Some(7200));
    }

    #[test]
    fn test_flags_for_environment() {
        let recipe = BuildRecipe {
            build_system: BuildSystem::Make {
                makefile: None,
                max_concurrency: Some(8),
            },
            prebuild_cmds: vec![],
            postbuild_cmds: vec![],
            flags: FlagSet {
                ldflags: vec!["-lnetcdf".to_string()],
                ..Default::default()
            },
            environ_flags: BTreeMap::from([(
                "gnu".to_string(),
                FlagSet {
                    fflags: vec!["-O2".to_string()],
                    ..Default::default()
                },
            )]),
        };
        let gnu = recipe.flags_for("gnu");
        assert_eq!(gnu.fflags, vec!["-O2"]);
        assert_eq!(gnu.ldflags, vec!["-lnetcdf"]);
        let intel = recipe.flags_for("intel");
        assert!(intel.fflags.is_empty());
        assert_eq!(intel.ldflags, vec!["-lnetcdf"]);
    }

    #[test]
    fn test_sweep_shape_delegates() {
        let shape = TestShape::ParameterSweep {
            sweep: Sweep {
                parameters: BTreeMap::from([(
                    "num_tasks".to_string(),
                    ParameterSpec::Notation("[4, 8, 16]".to_string()),
                )]),
                mode: ParameterMode::Product,
            },
            template: Box::new(TestShape::RunOnly { run: run_recipe() }),
        };
        assert!(shape.run().is_some());
        assert!(shape.build().is_none());
        assert_eq!(shape.sweep().unwrap().combinations().unwrap().len(), 3);
    }
}
