//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use hpc_regress::checks::{SuiteSpec, TestDefinition};
use hpc_regress::config::{
    EnvironmentConfig, LauncherKind, ModulesSystem, PartitionConfig, RegressConfig,
    SchedulerKind, SystemConfig,
};
use hpc_regress::pipeline::ExecutionPlan;

/// A single-partition site that runs everything on the local host
pub fn local_config() -> RegressConfig {
    site_with_scheduler("laptop", SchedulerKind::Local)
}

/// A single-partition site using `scheduler` with no modules system
pub fn site_with_scheduler(name: &str, scheduler: SchedulerKind) -> RegressConfig {
    let mut config = RegressConfig {
        systems: vec![SystemConfig {
            name: name.to_string(),
            descr: String::new(),
            hostnames: Vec::new(),
            modules_system: ModulesSystem::Nomod,
            partitions: vec![PartitionConfig {
                name: "default".to_string(),
                descr: String::new(),
                scheduler,
                launcher: LauncherKind::Local,
                access: Vec::new(),
                environs: vec!["builtin".to_string()],
                max_jobs: 4,
                resources: Vec::new(),
            }],
        }],
        environments: vec![
            EnvironmentConfig::new("builtin", &[]).with_compilers("cc", "c++", "gfortran"),
        ],
        ..Default::default()
    };
    config.runner.poll_interval = 0.05;
    config.runner.max_wait_secs = Some(60);
    config
}

/// Write `yaml` as `<dir>/<name>.yaml` and return the path
pub fn write_suite(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}.yaml", name));
    fs::write(&path, yaml).unwrap();
    path
}

/// Parse a suite held in memory
pub fn definitions(yaml: &str) -> Vec<TestDefinition> {
    SuiteSpec::from_str_with_format(yaml, "yaml")
        .unwrap()
        .definitions(Path::new("/nonexistent"))
        .unwrap()
}

/// Plan `yaml` on the first system of `config`, staging under `stage`
pub fn plan_for(config: &RegressConfig, yaml: &str, stage: &Path) -> ExecutionPlan {
    let defs = definitions(yaml);
    let system = &config.systems[0];
    ExecutionPlan::build(config, system, &defs, Some(stage.to_path_buf())).unwrap()
}

/// Directory holding the suites shipped with the crate
pub fn shipped_suites() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("suites")
}
