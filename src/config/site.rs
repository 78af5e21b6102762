//! Site description: systems, partitions, and programming environments.
//!
//! These records are loaded once at startup and shared read-only for the rest
//! of the session.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Batch scheduler used by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Pbs,
    Slurm,
    /// Run the job script directly on the current host
    Local,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Pbs => write!(f, "pbs"),
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Local => write!(f, "local"),
        }
    }
}

/// Parallel launcher placed in front of the executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    Mpirun,
    Mpiexec,
    Srun,
    /// No launcher; the executable runs as-is
    Local,
}

impl LauncherKind {
    /// Launcher prefix for a job with `num_tasks` ranks
    pub fn prefix(&self, num_tasks: u32) -> Vec<String> {
        match self {
            LauncherKind::Mpirun => vec!["mpirun".into(), "-np".into(), num_tasks.to_string()],
            LauncherKind::Mpiexec => vec!["mpiexec".into(), "-n".into(), num_tasks.to_string()],
            LauncherKind::Srun => vec!["srun".into()],
            LauncherKind::Local => Vec::new(),
        }
    }
}

/// Module system available on a system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulesSystem {
    #[default]
    Lmod,
    Tmod,
    Nomod,
}

impl ModulesSystem {
    /// Shell commands that load `modules` in order
    pub fn load_commands(&self, modules: &[String]) -> Vec<String> {
        match self {
            ModulesSystem::Lmod | ModulesSystem::Tmod => {
                modules.iter().map(|m| format!("module load {}", m)).collect()
            }
            ModulesSystem::Nomod => Vec::new(),
        }
    }
}

/// A named resource request template, e.g. `gpu` -> `:ngpus={num_gpus}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub name: String,
    pub options: Vec<String>,
}

impl ResourceTemplate {
    /// Render the options with `{key}` placeholders filled from `values`.
    /// Every placeholder must be supplied.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<Vec<String>, String> {
        let placeholder = Regex::new(r"\{(\w+)\}").map_err(|e| e.to_string())?;
        let mut rendered = Vec::with_capacity(self.options.len());
        for option in &self.options {
            let mut missing = None;
            let text = placeholder.replace_all(option, |caps: &regex::Captures| {
                let key = &caps[1];
                match values.get(key) {
                    Some(v) => v.clone(),
                    None => {
                        missing.get_or_insert_with(|| key.to_string());
                        String::new()
                    }
                }
            });
            if let Some(key) = missing {
                return Err(format!(
                    "resource '{}' requires a value for '{}'",
                    self.name, key
                ));
            }
            rendered.push(text.into_owned());
        }
        Ok(rendered)
    }
}

fn default_max_jobs() -> u32 {
    8
}

/// A named pool of compute nodes behind one scheduler/launcher pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition name (the part after `:` in `system:partition`)
    pub name: String,

    #[serde(default)]
    pub descr: String,

    pub scheduler: SchedulerKind,

    pub launcher: LauncherKind,

    /// Scheduler arguments added to every job (account, queue)
    #[serde(default)]
    pub access: Vec<String>,

    /// Environment names usable in this partition
    #[serde(default)]
    pub environs: Vec<String>,

    /// Maximum number of concurrently submitted jobs
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,

    #[serde(default)]
    pub resources: Vec<ResourceTemplate>,
}

impl PartitionConfig {
    pub fn get_resource(&self, name: &str) -> Option<&ResourceTemplate> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn supports_environ(&self, name: &str) -> bool {
        self.environs.iter().any(|e| e == name)
    }
}

/// A compiler/module configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,

    /// C compiler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,

    /// C++ compiler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cxx: Option<String>,

    /// Fortran compiler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftn: Option<String>,

    /// Modules loaded, in order, before build and run
    #[serde(default)]
    pub modules: Vec<String>,

    /// Environment variables exported before build and run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    pub fn new(name: &str, modules: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_compilers(mut self, cc: &str, cxx: &str, ftn: &str) -> Self {
        self.cc = Some(cc.to_string());
        self.cxx = Some(cxx.to_string());
        self.ftn = Some(ftn.to_string());
        self
    }

    pub fn compilers(&self) -> CompilerTriplet<'_> {
        CompilerTriplet {
            cc: self.cc.as_deref().unwrap_or("cc"),
            cxx: self.cxx.as_deref().unwrap_or("CC"),
            ftn: self.ftn.as_deref().unwrap_or("ftn"),
        }
    }
}

/// Compiler commands with the Cray-style wrapper names as fallbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerTriplet<'a> {
    pub cc: &'a str,
    pub cxx: &'a str,
    pub ftn: &'a str,
}

/// A named HPC system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System identifier (e.g., "casper")
    pub name: String,

    #[serde(default)]
    pub descr: String,

    /// Hostname patterns (regex, anchored at the start) used for detection
    #[serde(default)]
    pub hostnames: Vec<String>,

    #[serde(default)]
    pub modules_system: ModulesSystem,

    pub partitions: Vec<PartitionConfig>,
}

impl SystemConfig {
    pub fn get_partition(&self, name: &str) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Check if `hostname` matches one of this system's patterns
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|pattern| {
            Regex::new(&format!("^(?:{})", pattern))
                .map(|re| re.is_match(hostname))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_partition() -> PartitionConfig {
        PartitionConfig {
            name: "gpu".to_string(),
            descr: String::new(),
            scheduler: SchedulerKind::Pbs,
            launcher: LauncherKind::Local,
            access: vec!["-A SCSG0001".to_string()],
            environs: vec!["cuda".to_string()],
            max_jobs: 10,
            resources: vec![ResourceTemplate {
                name: "gpu".to_string(),
                options: vec![":ngpus={num_gpus}".to_string()],
            }],
        }
    }

    #[test]
    fn test_resource_render() {
        let partition = gpu_partition();
        let gpu = partition.get_resource("gpu").unwrap();
        let mut values = BTreeMap::new();
        values.insert("num_gpus".to_string(), "4".to_string());
        assert_eq!(gpu.render(&values).unwrap(), vec![":ngpus=4"]);

        let err = gpu.render(&BTreeMap::new()).unwrap_err();
        assert!(err.contains("num_gpus"));
    }

    #[test]
    fn test_hostname_patterns_are_anchored() {
        let system = SystemConfig {
            name: "casper".to_string(),
            descr: String::new(),
            hostnames: vec!["casper-login*".to_string()],
            modules_system: ModulesSystem::Lmod,
            partitions: vec![gpu_partition()],
        };
        assert!(system.matches_hostname("casper-login1"));
        assert!(!system.matches_hostname("derecho-casper-login1"));
        assert!(system.get_partition("gpu").is_some());
        assert!(system.get_partition("cpu").is_none());
    }

    #[test]
    fn test_launcher_prefix() {
        assert_eq!(LauncherKind::Mpirun.prefix(4), vec!["mpirun", "-np", "4"]);
        assert!(LauncherKind::Local.prefix(4).is_empty());
    }

    #[test]
    fn test_module_commands() {
        let modules = vec!["gcc/12.4.0".to_string()];
        assert_eq!(
            ModulesSystem::Lmod.load_commands(&modules),
            vec!["module load gcc/12.4.0"]
        );
        assert!(ModulesSystem::Nomod.load_commands(&modules).is_empty());
    }

    #[test]
    fn test_compiler_fallbacks() {
        let env = EnvironmentConfig::new("default-current", &["ncarenv/24.12"]);
        assert_eq!(env.compilers().cc, "cc");
        let env = env.with_compilers("mpicc", "mpicxx", "mpif90");
        assert_eq!(env.compilers().ftn, "mpif90");
    }
}
