//! Turns test definitions into concrete test instances for one system.
//!
//! An instance is one (partition, environment, parameter combination) of a
//! check, with every placeholder already substituted. Instances are
//! immutable; the executors only read them.

use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::checks::{
    BuildRecipe, BuildSystem, Combination, FlagSet, ParameterValue, RunRecipe, TestDefinition,
    substitute_parameters,
};
use crate::config::{EnvironmentConfig, ModulesSystem, PartitionConfig, RegressConfig, SystemConfig};
use crate::errors::PipelineError;
use crate::validate::{PerformanceRule, Reference, SanityRule, lookup_reference};

/// One resolved combination of check, partition, environment and
/// parameter values
#[derive(Debug, Clone, Serialize)]
pub struct TestInstance {
    /// `Check %param=value @system:partition+environ`
    pub name: String,
    pub check: String,
    pub suite: String,
    pub descr: String,
    pub tags: BTreeSet<String>,
    pub system: String,
    pub partition: PartitionConfig,
    pub environ: EnvironmentConfig,
    pub modules_system: ModulesSystem,
    pub parameters: Combination,
    /// Parameters and task counts as numbers, for derived metrics
    pub numeric_parameters: BTreeMap<String, f64>,
    pub stage_dir: PathBuf,
    pub sourcesdir: Option<PathBuf>,
    /// Environment modules followed by the check's own
    pub modules: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub build: Option<BuildRecipe>,
    pub run: Option<RunRecipe>,
    pub time_limit_secs: Option<u64>,
    pub sanity: Vec<SanityRule>,
    pub performance: Vec<PerformanceRule>,
    /// References that apply on this partition, by metric name
    pub references: BTreeMap<String, Reference>,
    /// Check names this instance waits for
    pub depends_on: Vec<String>,
}

impl TestInstance {
    pub fn is_compile_only(&self) -> bool {
        self.run.is_none()
    }

    /// `system:partition`
    pub fn target(&self) -> String {
        format!("{}:{}", self.system, self.partition.name)
    }
}

/// Instances of all definitions plus the definitions that could not be
/// resolved
#[derive(Debug, Default)]
pub struct Resolution {
    pub instances: Vec<TestInstance>,
    pub rejected: Vec<(String, PipelineError)>,
}

/// Resolves definitions against the active system
pub struct Resolver<'a> {
    config: &'a RegressConfig,
    system: &'a SystemConfig,
    stage_root: PathBuf,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a RegressConfig, system: &'a SystemConfig) -> Self {
        Self {
            config,
            system,
            stage_root: config.general.stage_dir.clone(),
        }
    }

    /// Place stages under `root` instead of the configured stage directory
    pub fn with_stage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.stage_root = root.into();
        self
    }

    /// Resolve every definition; a rejected definition does not stop the
    /// others
    pub fn resolve_all<'d, I>(&self, definitions: I) -> Resolution
    where
        I: IntoIterator<Item = &'d TestDefinition>,
    {
        let mut resolution = Resolution::default();
        for definition in definitions {
            match self.resolve(definition) {
                Ok(mut instances) => resolution.instances.append(&mut instances),
                Err(e) => resolution.rejected.push((definition.name.clone(), e)),
            }
        }
        resolution
    }

    /// Instances of one definition on the active system. A definition that
    /// is not valid on this system yields no instances.
    pub fn resolve(&self, definition: &TestDefinition) -> Result<Vec<TestInstance>, PipelineError> {
        let partitions = self.select_partitions(definition)?;
        if partitions.is_empty() {
            debug!(
                "Skipping check={} system={}: not valid here",
                definition.name, self.system.name
            );
            return Ok(Vec::new());
        }
        self.check_environ_names(definition)?;
        let combinations = definition
            .combinations()
            .map_err(|e| PipelineError::Configuration(format!("{}: {}", definition.name, e)))?;

        let mut instances = Vec::new();
        for partition in partitions {
            for environ_name in &partition.environs {
                if !self.environ_selected(definition, environ_name) {
                    continue;
                }
                let environ = self.config.get_environment(environ_name).ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "partition '{}' lists unknown environment '{}'",
                        partition.name, environ_name
                    ))
                })?;
                for combination in &combinations {
                    instances.push(self.instantiate(definition, partition, environ, combination)?);
                }
            }
        }
        debug!(
            "Resolved check={} instances={}",
            definition.name,
            instances.len()
        );
        Ok(instances)
    }

    /// Partitions of the active system named by `valid_systems`, in the
    /// system's declaration order
    fn select_partitions(
        &self,
        definition: &TestDefinition,
    ) -> Result<Vec<&'a PartitionConfig>, PipelineError> {
        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        for entry in &definition.valid_systems {
            let (system, partition) = match entry.split_once(':') {
                Some((s, p)) => (s, Some(p)),
                None => (entry.as_str(), None),
            };
            if system != "*" && system != self.system.name {
                continue;
            }
            match partition {
                None | Some("*") => {
                    wanted.extend(self.system.partitions.iter().map(|p| p.name.as_str()))
                }
                Some(name) => {
                    if self.system.get_partition(name).is_some() {
                        wanted.insert(name);
                    } else if system != "*" {
                        return Err(PipelineError::Configuration(format!(
                            "check '{}' names unknown partition '{}:{}'",
                            definition.name, system, name
                        )));
                    }
                }
            }
        }
        Ok(self
            .system
            .partitions
            .iter()
            .filter(|p| wanted.contains(p.name.as_str()))
            .collect())
    }

    fn check_environ_names(&self, definition: &TestDefinition) -> Result<(), PipelineError> {
        for name in &definition.valid_prog_environs {
            if name != "*" && self.config.get_environment(name).is_none() {
                return Err(PipelineError::Configuration(format!(
                    "check '{}' names unknown environment '{}'",
                    definition.name, name
                )));
            }
        }
        Ok(())
    }

    fn environ_selected(&self, definition: &TestDefinition, environ: &str) -> bool {
        definition
            .valid_prog_environs
            .iter()
            .any(|e| e == "*" || e == environ)
    }

    fn instantiate(
        &self,
        definition: &TestDefinition,
        partition: &PartitionConfig,
        environ: &EnvironmentConfig,
        parameters: &Combination,
    ) -> Result<TestInstance, PipelineError> {
        let name = instance_name(&definition.name, parameters, &self.system.name, &partition.name, &environ.name);
        let config_error = |e: String| PipelineError::Configuration(format!("{}: {}", name, e));

        let mut run = definition.shape.run().cloned();
        if let Some(run) = run.as_mut() {
            apply_task_parameters(run, parameters).map_err(config_error)?;
        }

        let mut values = builtin_values(&self.system.name, &partition.name, &environ.name, definition, run.as_ref());
        for (key, value) in &definition.variables {
            values.insert(key.clone(), ParameterValue::String(value.clone()));
        }
        values.extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        // Variables may refer to parameters and built-ins
        for key in definition.variables.keys() {
            if parameters.contains_key(key) {
                continue;
            }
            if let Some(ParameterValue::String(raw)) = values.get(key) {
                let expanded = substitute_parameters(raw, &values);
                values.insert(key.clone(), ParameterValue::String(expanded));
            }
        }

        let subst = |text: &str| substitute_parameters(text, &values);
        let build = definition
            .shape
            .build()
            .map(|b| substitute_build(b, &subst));
        let run = run.map(|r| substitute_run(r, &subst));
        let time_limit_secs = match &run {
            Some(r) => r.time_limit_secs(r.num_tasks).map_err(config_error)?,
            None => None,
        };

        let mut modules = environ.modules.clone();
        modules.extend(definition.modules.iter().map(|m| subst(m)));
        let mut env_vars = environ.env_vars.clone();
        env_vars.extend(definition.env_vars.iter().map(|(k, v)| (k.clone(), subst(v))));

        let mut numeric_parameters: BTreeMap<String, f64> = parameters
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect();
        if let Some(run) = &run {
            numeric_parameters
                .entry("num_tasks".to_string())
                .or_insert(run.num_tasks as f64);
            if let Some(per_node) = run.num_tasks_per_node {
                numeric_parameters
                    .entry("num_tasks_per_node".to_string())
                    .or_insert(per_node as f64);
            }
            if let Some(gpus) = run.num_gpus_per_node {
                numeric_parameters
                    .entry("num_gpus_per_node".to_string())
                    .or_insert(gpus as f64);
            }
        }

        let references = definition
            .performance
            .iter()
            .filter_map(|rule| {
                lookup_reference(&definition.references, &self.system.name, &partition.name, &rule.name)
                    .map(|r| (rule.name.clone(), r.clone()))
            })
            .collect();

        let stage_dir = self
            .stage_root
            .join(&self.system.name)
            .join(&partition.name)
            .join(&environ.name)
            .join(stage_dir_name(&definition.name, parameters));

        Ok(TestInstance {
            name,
            check: definition.name.clone(),
            suite: definition.suite.clone(),
            descr: definition.descr.clone(),
            tags: definition.tags.clone(),
            system: self.system.name.clone(),
            partition: partition.clone(),
            environ: environ.clone(),
            modules_system: self.system.modules_system,
            parameters: parameters.clone(),
            numeric_parameters,
            stage_dir,
            sourcesdir: definition.sourcesdir.clone(),
            modules,
            env_vars,
            build,
            run,
            time_limit_secs,
            sanity: definition.sanity.clone(),
            performance: definition.performance.clone(),
            references,
            depends_on: definition.depends_on.clone(),
        })
    }
}

/// `Check %a=1 %b=x @system:partition+environ`
pub fn instance_name(
    check: &str,
    parameters: &Combination,
    system: &str,
    partition: &str,
    environ: &str,
) -> String {
    let mut name = check.to_string();
    for (key, value) in parameters {
        name.push_str(&format!(" %{}={}", key, value));
    }
    name.push_str(&format!(" @{}:{}+{}", system, partition, environ));
    name
}

/// Directory name of an instance's stage: the check name plus its
/// parameter values, restricted to filesystem-safe characters
pub fn stage_dir_name(check: &str, parameters: &Combination) -> String {
    let mut name = check.to_string();
    for (key, value) in parameters {
        name.push_str(&format!("_{}_{}", key, value));
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parameters named after run fields override them
fn apply_task_parameters(run: &mut RunRecipe, parameters: &Combination) -> Result<(), String> {
    let as_u32 = |name: &str, value: &ParameterValue| -> Result<u32, String> {
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| format!("parameter '{}' must be a non-negative integer, got '{}'", name, value))
    };
    if let Some(value) = parameters.get("num_tasks") {
        run.num_tasks = as_u32("num_tasks", value)?;
    }
    if let Some(value) = parameters.get("num_tasks_per_node") {
        run.num_tasks_per_node = Some(as_u32("num_tasks_per_node", value)?);
    }
    if let Some(value) = parameters.get("num_gpus_per_node") {
        run.num_gpus_per_node = Some(as_u32("num_gpus_per_node", value)?);
    }
    Ok(())
}

fn builtin_values(
    system: &str,
    partition: &str,
    environ: &str,
    definition: &TestDefinition,
    run: Option<&RunRecipe>,
) -> Combination {
    let mut values = Combination::new();
    let text = |s: &str| ParameterValue::String(s.to_string());
    values.insert("system".to_string(), text(system));
    values.insert("partition".to_string(), text(partition));
    values.insert("environ".to_string(), text(environ));
    values.insert("check".to_string(), text(&definition.name));
    if let Some(run) = run {
        values.insert("num_tasks".to_string(), ParameterValue::Integer(run.num_tasks as i64));
        if let Some(per_node) = run.num_tasks_per_node {
            values.insert("num_tasks_per_node".to_string(), ParameterValue::Integer(per_node as i64));
        }
        if let Some(gpus) = run.num_gpus_per_node {
            values.insert("num_gpus_per_node".to_string(), ParameterValue::Integer(gpus as i64));
        }
    }
    values
}

fn substitute_all(items: &[String], subst: &impl Fn(&str) -> String) -> Vec<String> {
    items.iter().map(|s| subst(s)).collect()
}

fn substitute_flags(flags: &FlagSet, subst: &impl Fn(&str) -> String) -> FlagSet {
    FlagSet {
        cppflags: substitute_all(&flags.cppflags, subst),
        cflags: substitute_all(&flags.cflags, subst),
        cxxflags: substitute_all(&flags.cxxflags, subst),
        fflags: substitute_all(&flags.fflags, subst),
        ldflags: substitute_all(&flags.ldflags, subst),
        options: substitute_all(&flags.options, subst),
    }
}

fn substitute_build(build: &BuildRecipe, subst: &impl Fn(&str) -> String) -> BuildRecipe {
    let build_system = match &build.build_system {
        BuildSystem::Make {
            makefile,
            max_concurrency,
        } => BuildSystem::Make {
            makefile: makefile.as_deref().map(subst),
            max_concurrency: *max_concurrency,
        },
        BuildSystem::SingleSource {
            sourcepath,
            executable,
        } => BuildSystem::SingleSource {
            sourcepath: subst(sourcepath),
            executable: executable.as_deref().map(subst),
        },
        BuildSystem::Custom { commands } => BuildSystem::Custom {
            commands: substitute_all(commands, subst),
        },
    };
    BuildRecipe {
        build_system,
        prebuild_cmds: substitute_all(&build.prebuild_cmds, subst),
        postbuild_cmds: substitute_all(&build.postbuild_cmds, subst),
        flags: substitute_flags(&build.flags, subst),
        environ_flags: build
            .environ_flags
            .iter()
            .map(|(k, v)| (k.clone(), substitute_flags(v, subst)))
            .collect(),
    }
}

fn substitute_run(run: RunRecipe, subst: &impl Fn(&str) -> String) -> RunRecipe {
    RunRecipe {
        executable: subst(&run.executable),
        executable_opts: substitute_all(&run.executable_opts, subst),
        prerun_cmds: substitute_all(&run.prerun_cmds, subst),
        postrun_cmds: substitute_all(&run.postrun_cmds, subst),
        job_options: substitute_all(&run.job_options, subst),
        extra_resources: run
            .extra_resources
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    values.iter().map(|(k, v)| (k.clone(), subst(v))).collect(),
                )
            })
            .collect(),
        ..run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::SuiteSpec;
    use std::path::Path;

    fn definitions(yaml: &str) -> Vec<TestDefinition> {
        SuiteSpec::from_str_with_format(yaml, "yaml")
            .unwrap()
            .definitions(Path::new("/suites/test"))
            .unwrap()
    }

    const SCALING: &str = r#"
name: cm1
checks:
  - name: CM1StrongScalingTest
    valid_systems: ['casper:compute']
    valid_prog_environs: ['gnu', 'intel']
    parameters:
      num_tasks: '[4, 8, 16]'
    build:
      build_system: make
      prebuild_cmds: ['cp -r {cm1_source_dir} .']
      flags:
        options: ['pcols={num_tasks}', 'COMPILER={environ}']
    run:
      executable: ./cm1.exe
      num_tasks: 1
      time_limit_steps:
        - {max_tasks: 8, time_limit: 2h}
        - {max_tasks: 32, time_limit: 1h}
      time_limit: 30m
    variables:
      cm1_source_dir: /glade/work/{check}
"#;

    #[test]
    fn test_instance_count_and_names() {
        let config = RegressConfig::builtin();
        let system = config.get_system("casper").unwrap();
        let defs = definitions(SCALING);
        let instances = Resolver::new(&config, system).resolve(&defs[0]).unwrap();
        assert_eq!(instances.len(), 2 * 3);
        assert_eq!(
            instances[0].name,
            "CM1StrongScalingTest %num_tasks=4 @casper:compute+gnu"
        );
        let names: BTreeSet<_> = instances.iter().map(|i| i.name.clone()).collect();
        assert_eq!(names.len(), instances.len());
    }

    #[test]
    fn test_parameters_substituted() {
        let config = RegressConfig::builtin();
        let system = config.get_system("casper").unwrap();
        let defs = definitions(SCALING);
        let instances = Resolver::new(&config, system)
            .with_stage_root("/scratch/stage")
            .resolve(&defs[0])
            .unwrap();
        let intel16 = instances
            .iter()
            .find(|i| i.environ.name == "intel" && i.parameters["num_tasks"] == ParameterValue::Integer(16))
            .unwrap();
        let run = intel16.run.as_ref().unwrap();
        assert_eq!(run.num_tasks, 16);
        assert_eq!(intel16.time_limit_secs, Some(3600));
        let build = intel16.build.as_ref().unwrap();
        assert_eq!(build.flags.options, vec!["pcols=16", "COMPILER=intel"]);
        assert_eq!(build.prebuild_cmds, vec!["cp -r /glade/work/CM1StrongScalingTest ."]);
        assert_eq!(intel16.numeric_parameters["num_tasks"], 16.0);
        assert_eq!(
            intel16.stage_dir,
            PathBuf::from("/scratch/stage/casper/compute/intel/CM1StrongScalingTest_num_tasks_16")
        );
    }

    #[test]
    fn test_other_system_yields_nothing() {
        let config = RegressConfig::builtin();
        let system = config.get_system("casper").unwrap();
        let defs = definitions(
            r#"
name: elsewhere
checks:
  - name: DerechoOnly
    valid_systems: ['derecho:cpu']
    valid_prog_environs: ['gnu']
    run: {executable: hostname}
"#,
        );
        assert!(Resolver::new(&config, system).resolve(&defs[0]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_partition_and_environ() {
        let config = RegressConfig::builtin();
        let system = config.get_system("casper").unwrap();
        let defs = definitions(
            r#"
name: broken
checks:
  - name: BadPartition
    valid_systems: ['casper:bigmem']
    valid_prog_environs: ['gnu']
    run: {executable: hostname}
  - name: BadEnviron
    valid_systems: ['casper:compute']
    valid_prog_environs: ['pgi']
    run: {executable: hostname}
"#,
        );
        let resolution = Resolver::new(&config, system).resolve_all(&defs);
        assert!(resolution.instances.is_empty());
        assert_eq!(resolution.rejected.len(), 2);
        for (_, err) in &resolution.rejected {
            assert!(matches!(err, PipelineError::Configuration(_)));
        }
    }

    #[test]
    fn test_wildcards() {
        let config = RegressConfig::builtin();
        let system = config.get_system("casper").unwrap();
        let defs = definitions(
            r#"
name: hello
checks:
  - name: HelloWorldTest
    valid_systems: ['*']
    valid_prog_environs: ['*']
    build: {build_system: single_source, sourcepath: hello.c}
"#,
        );
        let instances = Resolver::new(&config, system).resolve(&defs[0]).unwrap();
        let expected: usize = system.partitions.iter().map(|p| p.environs.len()).sum();
        assert_eq!(instances.len(), expected);
        assert!(instances.iter().all(|i| i.is_compile_only()));
    }
}
