//! Suite files.
//!
//! A suite file holds a `defaults` record and a list of `checks`, each an
//! override record applied on top of the defaults:
//!
//! ```yaml
//! name: stream
//! defaults:
//!   valid_systems: ['casper:compute']
//!   valid_prog_environs: [gnu-serial]
//!   build:
//!     prebuild_cmds: ['cp -r {stream_source_dir} .', 'cd STREAM']
//! checks:
//!   - name: STREAMCompileTest
//!     kind: compile_only
//!     append_prebuild_cmds: ['make clean']
//! ```
//!
//! Scalars and lists in a check replace the inherited value. The
//! `append_*` lists extend it. Nested `build` and `run` records and the
//! string maps merge key by key.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::definition::{
    BuildRecipe, BuildSystem, FlagSet, RunRecipe, Sweep, TestDefinition, TestShape,
    TimeLimitStep,
};
use super::parameters::{ParameterMode, ParameterSpec};
use crate::validate::{PerformanceRule, ReferenceTable, SanityRule};

/// Shape of a check as written in a suite file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    CompileOnly,
    RunOnly,
    CompileAndRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSystemKind {
    Make,
    SingleSource,
    Custom,
}

fn merge_opt<T: Clone>(over: &Option<T>, base: &Option<T>) -> Option<T> {
    over.clone().or_else(|| base.clone())
}

fn merge_map<V: Clone>(
    over: &Option<BTreeMap<String, V>>,
    base: &Option<BTreeMap<String, V>>,
) -> Option<BTreeMap<String, V>> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut merged = b.clone();
            merged.extend(o.iter().map(|(k, v)| (k.clone(), v.clone())));
            Some(merged)
        }
    }
}

/// Inherited list, replaced by `set` when given, then extended by `append`
fn merge_list(
    set: &Option<Vec<String>>,
    append: &Option<Vec<String>>,
    base: &Option<Vec<String>>,
) -> Option<Vec<String>> {
    let mut list = merge_opt(set, base);
    if let Some(extra) = append {
        list.get_or_insert_with(Vec::new).extend(extra.iter().cloned());
    }
    list
}

/// Build section of a suite record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_system: Option<BuildSystemKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub makefile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sourcepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prebuild_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_prebuild_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postbuild_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environ_flags: Option<BTreeMap<String, FlagSet>>,
}

impl BuildSpec {
    pub fn merge(&self, over: &BuildSpec) -> BuildSpec {
        BuildSpec {
            build_system: merge_opt(&over.build_system, &self.build_system),
            makefile: merge_opt(&over.makefile, &self.makefile),
            max_concurrency: merge_opt(&over.max_concurrency, &self.max_concurrency),
            sourcepath: merge_opt(&over.sourcepath, &self.sourcepath),
            executable: merge_opt(&over.executable, &self.executable),
            commands: merge_opt(&over.commands, &self.commands),
            prebuild_cmds: merge_list(
                &over.prebuild_cmds,
                &over.append_prebuild_cmds,
                &merge_list(&self.prebuild_cmds, &self.append_prebuild_cmds, &None),
            ),
            append_prebuild_cmds: None,
            postbuild_cmds: merge_opt(&over.postbuild_cmds, &self.postbuild_cmds),
            flags: merge_opt(&over.flags, &self.flags),
            environ_flags: merge_map(&over.environ_flags, &self.environ_flags),
        }
    }

    fn into_recipe(self) -> Result<BuildRecipe, String> {
        let build_system = match self.build_system.unwrap_or(BuildSystemKind::Make) {
            BuildSystemKind::Make => BuildSystem::Make {
                makefile: self.makefile,
                max_concurrency: self.max_concurrency,
            },
            BuildSystemKind::SingleSource => BuildSystem::SingleSource {
                sourcepath: self
                    .sourcepath
                    .ok_or("single_source build requires 'sourcepath'")?,
                executable: self.executable,
            },
            BuildSystemKind::Custom => {
                let commands = self.commands.unwrap_or_default();
                if commands.is_empty() {
                    return Err("custom build requires at least one command".to_string());
                }
                BuildSystem::Custom { commands }
            }
        };
        Ok(BuildRecipe {
            build_system,
            prebuild_cmds: merge_list(&self.prebuild_cmds, &self.append_prebuild_cmds, &None)
                .unwrap_or_default(),
            postbuild_cmds: self.postbuild_cmds.unwrap_or_default(),
            flags: self.flags.unwrap_or_default(),
            environ_flags: self.environ_flags.unwrap_or_default(),
        })
    }
}

/// Run section of a suite record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_opts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerun_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_prerun_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postrun_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_postrun_cmds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_tasks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_tasks_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_gpus_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_steps: Option<Vec<TimeLimitStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_resources: Option<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_launcher: Option<bool>,
}

impl RunSpec {
    pub fn merge(&self, over: &RunSpec) -> RunSpec {
        let base_prerun = merge_list(&self.prerun_cmds, &self.append_prerun_cmds, &None);
        let base_postrun = merge_list(&self.postrun_cmds, &self.append_postrun_cmds, &None);
        RunSpec {
            executable: merge_opt(&over.executable, &self.executable),
            executable_opts: merge_opt(&over.executable_opts, &self.executable_opts),
            prerun_cmds: merge_list(&over.prerun_cmds, &over.append_prerun_cmds, &base_prerun),
            append_prerun_cmds: None,
            postrun_cmds: merge_list(&over.postrun_cmds, &over.append_postrun_cmds, &base_postrun),
            append_postrun_cmds: None,
            num_tasks: merge_opt(&over.num_tasks, &self.num_tasks),
            num_tasks_per_node: merge_opt(&over.num_tasks_per_node, &self.num_tasks_per_node),
            num_gpus_per_node: merge_opt(&over.num_gpus_per_node, &self.num_gpus_per_node),
            time_limit: merge_opt(&over.time_limit, &self.time_limit),
            time_limit_steps: merge_opt(&over.time_limit_steps, &self.time_limit_steps),
            extra_resources: merge_map(&over.extra_resources, &self.extra_resources),
            job_options: merge_opt(&over.job_options, &self.job_options),
            poll_interval: merge_opt(&over.poll_interval, &self.poll_interval),
            use_launcher: merge_opt(&over.use_launcher, &self.use_launcher),
        }
    }

    fn into_recipe(self) -> Result<RunRecipe, String> {
        let executable = self
            .executable
            .filter(|e| !e.trim().is_empty())
            .ok_or("run section requires 'executable'")?;
        let num_tasks = self.num_tasks.unwrap_or(1);
        if num_tasks == 0 {
            return Err("num_tasks must be at least 1".to_string());
        }
        if let Some(limit) = &self.time_limit {
            crate::time_utils::duration_string_to_seconds(limit)
                .map_err(|e| format!("time_limit: {}", e))?;
        }
        let mut steps = self.time_limit_steps.unwrap_or_default();
        for step in &steps {
            crate::time_utils::duration_string_to_seconds(&step.time_limit)
                .map_err(|e| format!("time_limit_steps: {}", e))?;
        }
        steps.sort_by_key(|s| s.max_tasks);
        Ok(RunRecipe {
            executable,
            executable_opts: self.executable_opts.unwrap_or_default(),
            prerun_cmds: merge_list(&self.prerun_cmds, &self.append_prerun_cmds, &None)
                .unwrap_or_default(),
            postrun_cmds: merge_list(&self.postrun_cmds, &self.append_postrun_cmds, &None)
                .unwrap_or_default(),
            num_tasks,
            num_tasks_per_node: self.num_tasks_per_node,
            num_gpus_per_node: self.num_gpus_per_node,
            time_limit: self.time_limit,
            time_limit_steps: steps,
            extra_resources: self.extra_resources.unwrap_or_default(),
            job_options: self.job_options.unwrap_or_default(),
            poll_interval: self.poll_interval,
            use_launcher: self.use_launcher.unwrap_or(true),
        })
    }
}

/// One check (or the suite defaults) as written in a suite file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CheckKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    /// Set to false to keep a check in the file without running it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_systems: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_prog_environs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sourcesdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, ParameterSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_mode: Option<ParameterMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanity: Option<Vec<SanityRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<Vec<PerformanceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceTable>,
}

impl CheckSpec {
    /// Apply `over` on top of `self`
    pub fn merge(&self, over: &CheckSpec) -> CheckSpec {
        let nested = |a: &Option<BuildSpec>, b: &Option<BuildSpec>| match (a, b) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => merge_opt(b, a),
        };
        let nested_run = |a: &Option<RunSpec>, b: &Option<RunSpec>| match (a, b) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => merge_opt(b, a),
        };
        CheckSpec {
            name: merge_opt(&over.name, &self.name),
            kind: merge_opt(&over.kind, &self.kind),
            descr: merge_opt(&over.descr, &self.descr),
            tags: merge_opt(&over.tags, &self.tags),
            enabled: merge_opt(&over.enabled, &self.enabled),
            valid_systems: merge_opt(&over.valid_systems, &self.valid_systems),
            valid_prog_environs: merge_opt(&over.valid_prog_environs, &self.valid_prog_environs),
            sourcesdir: merge_opt(&over.sourcesdir, &self.sourcesdir),
            variables: merge_map(&over.variables, &self.variables),
            modules: merge_opt(&over.modules, &self.modules),
            env_vars: merge_map(&over.env_vars, &self.env_vars),
            depends_on: merge_opt(&over.depends_on, &self.depends_on),
            parameters: merge_opt(&over.parameters, &self.parameters),
            parameter_mode: merge_opt(&over.parameter_mode, &self.parameter_mode),
            build: nested(&self.build, &over.build),
            run: nested_run(&self.run, &over.run),
            sanity: merge_opt(&over.sanity, &self.sanity),
            performance: merge_opt(&over.performance, &self.performance),
            reference: merge_opt(&over.reference, &self.reference),
        }
    }

    /// Turn a merged record into a definition. `suite_dir` anchors
    /// `sourcesdir`; without one, a `src/` directory next to the suite file
    /// is used when present.
    pub fn into_definition(self, suite: &str, suite_dir: &Path) -> Result<TestDefinition, String> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or("check without a name")?;
        let kind = self.kind.unwrap_or_else(|| match (&self.build, &self.run) {
            (Some(_), None) => CheckKind::CompileOnly,
            (None, Some(_)) => CheckKind::RunOnly,
            _ => CheckKind::CompileAndRun,
        });

        let build = || -> Result<BuildRecipe, String> {
            self.build.clone().unwrap_or_default().into_recipe()
        };
        let run = || -> Result<RunRecipe, String> {
            self.run
                .clone()
                .ok_or_else(|| format!("{} check requires a 'run' section", kind_name(kind)))?
                .into_recipe()
        };
        let base_shape = match kind {
            CheckKind::CompileOnly => TestShape::CompileOnly { build: build()? },
            CheckKind::RunOnly => TestShape::RunOnly { run: run()? },
            CheckKind::CompileAndRun => TestShape::CompileAndRun {
                build: build()?,
                run: run()?,
            },
        };
        let shape = match self.parameters.filter(|p| !p.is_empty()) {
            Some(parameters) => {
                let sweep = Sweep {
                    parameters,
                    mode: self.parameter_mode.unwrap_or_default(),
                };
                sweep.combinations()?;
                TestShape::ParameterSweep {
                    sweep,
                    template: Box::new(base_shape),
                }
            }
            None => base_shape,
        };

        let sourcesdir = match self.sourcesdir {
            Some(dir) => Some(suite_dir.join(dir)),
            None => Some(suite_dir.join("src")).filter(|p| p.is_dir()),
        };

        Ok(TestDefinition {
            name,
            descr: self.descr.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            valid_systems: self.valid_systems.unwrap_or_default(),
            valid_prog_environs: self.valid_prog_environs.unwrap_or_default(),
            sourcesdir,
            variables: self.variables.unwrap_or_default(),
            modules: self.modules.unwrap_or_default(),
            env_vars: self.env_vars.unwrap_or_default(),
            depends_on: self.depends_on.unwrap_or_default(),
            shape,
            sanity: self.sanity.unwrap_or_default(),
            performance: self.performance.unwrap_or_default(),
            references: self.reference.unwrap_or_default(),
            suite: suite.to_string(),
        })
    }
}

fn kind_name(kind: CheckKind) -> &'static str {
    match kind {
        CheckKind::CompileOnly => "compile_only",
        CheckKind::RunOnly => "run_only",
        CheckKind::CompileAndRun => "compile_and_run",
    }
}

/// Contents of one suite file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
    #[serde(default)]
    pub defaults: CheckSpec,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

impl SuiteSpec {
    /// Read a suite file; the format follows the extension (yaml, yml,
    /// json, json5, toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SuiteSpec> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite file {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();
        Self::from_str_with_format(&content, &extension)
            .with_context(|| format!("Invalid suite file {}", path.display()))
    }

    pub fn from_str_with_format(content: &str, format: &str) -> Result<SuiteSpec> {
        // Every format goes through serde_json::Value so they behave alike
        let value: serde_json::Value = match format {
            "json" => serde_json::from_str(content)?,
            "json5" => json5::from_str(content)?,
            "yaml" | "yml" => serde_yaml::from_str(content)?,
            "toml" => toml::from_str(content)?,
            other => bail!("Unknown suite format '{}'", other),
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Merge every enabled check with the defaults. Disabled checks are
    /// dropped; duplicate names are an error.
    pub fn definitions(&self, suite_dir: &Path) -> Result<Vec<TestDefinition>> {
        let mut seen = BTreeSet::new();
        let mut definitions = Vec::new();
        for (index, check) in self.checks.iter().enumerate() {
            let merged = self.defaults.merge(check);
            if merged.enabled == Some(false) {
                continue;
            }
            let label = merged
                .name
                .clone()
                .unwrap_or_else(|| format!("#{}", index));
            let definition = merged
                .into_definition(&self.name, suite_dir)
                .map_err(|e| anyhow::anyhow!("suite '{}', check {}: {}", self.name, label, e))?;
            if !seen.insert(definition.name.clone()) {
                bail!(
                    "suite '{}': duplicate check name '{}'",
                    self.name,
                    definition.name
                );
            }
            definitions.push(definition);
        }
        Ok(definitions)
    }
}

/// Suite file path plus what it defines
#[derive(Debug, Clone)]
pub struct LoadedSuite {
    pub path: PathBuf,
    pub spec: SuiteSpec,
    pub definitions: Vec<TestDefinition>,
}

impl LoadedSuite {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LoadedSuite> {
        let path = path.as_ref().to_path_buf();
        let spec = SuiteSpec::from_file(&path)?;
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let definitions = spec.definitions(&dir)?;
        Ok(LoadedSuite {
            path,
            spec,
            definitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
name: stream
defaults:
  valid_systems: ['casper:compute']
  valid_prog_environs: [gnu-serial]
  tags: [memory]
  build:
    prebuild_cmds: ['cp -r /src/STREAM .', 'cd STREAM']
    environ_flags:
      gnu:
        cflags: ['-O2', '-fopenmp']
  run:
    num_tasks: 4
    num_tasks_per_node: 4
    time_limit: 10m
    prerun_cmds: ['ls -lh']
checks:
  - name: STREAMCompileTest
    kind: compile_only
    build:
      makefile: Makefile
      append_prebuild_cmds: ['make clean']
    sanity:
      - kind: file_exists
        any_of: [STREAM/stream_c.exe]
  - name: STREAMQuickTest
    kind: run_only
    depends_on: [STREAMCompileTest]
    run:
      executable: stream_c.exe
      append_prerun_cmds: ['pwd']
      job_options: ['-Wblock=true']
      poll_interval: 30
  - name: Disabled
    kind: run_only
    enabled: false
"#;

    #[test]
    fn test_defaults_and_overrides() {
        let suite = SuiteSpec::from_str_with_format(SUITE, "yaml").unwrap();
        let defs = suite.definitions(Path::new("/nonexistent")).unwrap();
        assert_eq!(defs.len(), 2);

        let compile = &defs[0];
        let build = compile.shape.build().unwrap();
        assert_eq!(
            build.prebuild_cmds,
            vec!["cp -r /src/STREAM .", "cd STREAM", "make clean"]
        );
        assert_eq!(build.flags_for("gnu").cflags, vec!["-O2", "-fopenmp"]);
        assert!(compile.shape.run().is_none());
        assert!(compile.has_tag("memory"));
        assert!(compile.sourcesdir.is_none());

        let quick = &defs[1];
        let run = quick.shape.run().unwrap();
        assert_eq!(run.prerun_cmds, vec!["ls -lh", "pwd"]);
        assert_eq!(run.num_tasks, 4);
        assert_eq!(run.poll_interval, Some(30.0));
        assert_eq!(quick.depends_on, vec!["STREAMCompileTest"]);
    }

    #[test]
    fn test_list_override_replaces() {
        let base = CheckSpec {
            modules: Some(vec!["mkl".to_string()]),
            variables: Some(BTreeMap::from([("a".to_string(), "1".to_string())])),
            ..Default::default()
        };
        let over = CheckSpec {
            modules: Some(vec!["nco".to_string(), "ncview".to_string()]),
            variables: Some(BTreeMap::from([("b".to_string(), "2".to_string())])),
            ..Default::default()
        };
        let merged = base.merge(&over);
        assert_eq!(merged.modules.unwrap(), vec!["nco", "ncview"]);
        assert_eq!(merged.variables.unwrap().len(), 2);
    }

    #[test]
    fn test_sweep_and_errors() {
        let suite = SuiteSpec::from_str_with_format(
            r#"{
                "name": "scaling",
                "checks": [
                    {"name": "strong", "kind": "run_only",
                     "parameters": {"num_tasks": "[4, 8, 16]"},
                     "run": {"executable": "./cm1.exe", "time_limit": "1h"}},
                    {"name": "broken", "kind": "run_only"}
                ]
            }"#,
            "json",
        )
        .unwrap();
        let err = suite.definitions(Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("requires a 'run' section"));

        let mut ok = suite.clone();
        ok.checks.pop();
        let defs = ok.definitions(Path::new(".")).unwrap();
        assert_eq!(defs[0].shape.name(), "parameter_sweep");
        assert_eq!(defs[0].combinations().unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = SuiteSpec::from_str_with_format(
            "name: x\nchecks:\n  - name: a\n    valid_system: ['*']\n",
            "yaml",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_single_source_requires_sourcepath() {
        let suite = SuiteSpec::from_str_with_format(
            "name: hello\nchecks:\n  - name: HelloTest\n    kind: compile_only\n    build: {build_system: single_source}\n",
            "yaml",
        )
        .unwrap();
        assert!(suite.definitions(Path::new(".")).is_err());
    }
}
