//! NCAR Casper site profile
//!
//! Casper is a heterogeneous analysis and visualization cluster at NCAR:
//! - CPU compute nodes scheduled through PBS (`-q casper`)
//! - Single- and multi-GPU nodes (A100/V100/L40) requested with `ngpus`/`gpu_type`
//!
//! Detection: hostname `casper-login*`

use super::site::{
    EnvironmentConfig, LauncherKind, ModulesSystem, PartitionConfig, ResourceTemplate,
    SchedulerKind, SystemConfig,
};

/// Account and queue for every Casper job
pub const CASPER_ACCESS: &[&str] = &["-A SCSG0001", "-q casper"];

/// Which generation of the software stack a module list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// Modules loaded by default with the production stack
    Current,
    /// Defaults of the previous production stack
    Last,
    /// Candidate modules for the next stack
    Dev,
}

/// An immutable module list keyed by system, stack generation, and compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStack {
    pub system: &'static str,
    pub kind: StackKind,
    pub compiler: &'static str,
    pub modules: &'static [&'static str],
}

const CASPER_STACKS: &[ModuleStack] = &[
    ModuleStack {
        system: "casper",
        kind: StackKind::Current,
        compiler: "default",
        modules: &[
            "ncarenv/24.12",
            "intel/2024.2.1",
            "openmpi/5.0.6",
            "ncarcompilers/1.0.0",
            "cuda/12.3.2",
            "netcdf/4.9.2",
            "hdf5/1.12.3",
            "ucx/1.17.0",
        ],
    },
    ModuleStack {
        system: "casper",
        kind: StackKind::Last,
        compiler: "default",
        modules: &[
            "ncarenv/23.10",
            "intel/2023.2.1",
            "openmpi/4.1.6",
            "ncarcompilers/1.0.0",
            "cuda/12.2.1",
            "netcdf/4.9.2",
            "hdf5/1.12.2",
            "ucx/1.14.1",
        ],
    },
    ModuleStack {
        system: "casper",
        kind: StackKind::Dev,
        compiler: "default",
        modules: &[
            "ncarenv/25.10",
            "intel/2025.2.1",
            "openmpi/5.0.8",
            "ncarcompilers/1.1.0",
            "cuda/12.9.0",
            "netcdf/4.9.3",
            "hdf5/1.14.6",
            "ucx/1.19.0",
        ],
    },
    ModuleStack {
        system: "casper",
        kind: StackKind::Current,
        compiler: "intel",
        modules: &[
            "ncarenv/24.12",
            "intel/2024.2.1",
            "openmpi/5.0.6",
            "ncarcompilers/1.0.0",
            "cuda/12.3.2",
            "netcdf/4.9.2",
            "hdf5/1.12.3",
            "ucx/1.17.0",
        ],
    },
    ModuleStack {
        system: "casper",
        kind: StackKind::Current,
        compiler: "gnu",
        modules: &[
            "ncarenv/24.12",
            "gcc/12.4.0",
            "openmpi/5.0.6",
            "ncarcompilers/1.0.0",
            "cuda/12.3.2",
            "netcdf/4.9.2",
            "hdf5/1.12.3",
            "ucx/1.17.0",
        ],
    },
];

/// All known module stacks
pub fn module_stacks() -> &'static [ModuleStack] {
    CASPER_STACKS
}

/// Look up a module stack
pub fn module_stack(
    system: &str,
    kind: StackKind,
    compiler: &str,
) -> Option<&'static ModuleStack> {
    CASPER_STACKS
        .iter()
        .find(|s| s.system == system && s.kind == kind && s.compiler == compiler)
}

fn stack_modules(kind: StackKind, compiler: &str) -> Vec<String> {
    module_stack("casper", kind, compiler)
        .map(|s| s.modules.iter().map(|m| m.to_string()).collect())
        .unwrap_or_default()
}

fn mpi_environment(name: &str, kind: StackKind, compiler: &str) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.to_string(),
        modules: stack_modules(kind, compiler),
        ..Default::default()
    }
    .with_compilers("mpicc", "mpicxx", "mpif90")
}

fn module_environment(name: &str, kind: StackKind) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.to_string(),
        modules: stack_modules(kind, "default"),
        ..Default::default()
    }
}

/// Create the Casper system description
pub fn casper_system() -> SystemConfig {
    SystemConfig {
        name: "casper".to_string(),
        descr: "HPC Cluster".to_string(),
        hostnames: vec!["casper-login*".to_string()],
        modules_system: ModulesSystem::Lmod,
        partitions: casper_partitions(),
    }
}

fn access() -> Vec<String> {
    CASPER_ACCESS.iter().map(|a| a.to_string()).collect()
}

fn gpu_resources() -> Vec<ResourceTemplate> {
    vec![
        ResourceTemplate {
            name: "gpu".to_string(),
            options: vec![":ngpus={num_gpus}".to_string()],
        },
        ResourceTemplate {
            name: "gpu_type".to_string(),
            options: vec![":gpu_type={gpu_type}".to_string()],
        },
    ]
}

fn casper_partitions() -> Vec<PartitionConfig> {
    vec![
        PartitionConfig {
            name: "compute".to_string(),
            descr: "Compute nodes".to_string(),
            scheduler: SchedulerKind::Pbs,
            launcher: LauncherKind::Mpirun,
            access: access(),
            environs: vec!["gnu".to_string(), "intel".to_string()],
            max_jobs: 100,
            resources: Vec::new(),
        },
        PartitionConfig {
            name: "compute-serial".to_string(),
            descr: "Compute nodes".to_string(),
            scheduler: SchedulerKind::Pbs,
            launcher: LauncherKind::Local,
            access: access(),
            environs: vec!["gnu-serial".to_string()],
            max_jobs: 100,
            resources: Vec::new(),
        },
        PartitionConfig {
            name: "gpu".to_string(),
            descr: "Single GPU, Single Node".to_string(),
            scheduler: SchedulerKind::Pbs,
            launcher: LauncherKind::Local,
            access: access(),
            environs: vec![
                "cuda".to_string(),
                "cuda-last".to_string(),
                "cuda-dev".to_string(),
            ],
            max_jobs: 10,
            resources: gpu_resources(),
        },
        PartitionConfig {
            name: "gpu-mpi".to_string(),
            descr: "Multi-GPU".to_string(),
            scheduler: SchedulerKind::Pbs,
            launcher: LauncherKind::Mpirun,
            access: access(),
            environs: vec![
                "cuda".to_string(),
                "cuda-last".to_string(),
                "cuda-dev".to_string(),
            ],
            max_jobs: 10,
            resources: gpu_resources(),
        },
    ]
}

/// Programming environments shared by the Casper partitions
pub fn casper_environments() -> Vec<EnvironmentConfig> {
    vec![
        mpi_environment("gnu", StackKind::Current, "gnu"),
        EnvironmentConfig::new("gnu-serial", &["gcc/12.4.0"]).with_compilers(
            "gcc",
            "g++",
            "gfortran",
        ),
        mpi_environment("intel", StackKind::Current, "intel"),
        mpi_environment("intel-last", StackKind::Last, "default"),
        mpi_environment("intel-dev", StackKind::Dev, "default"),
        mpi_environment("cuda", StackKind::Current, "default"),
        mpi_environment("cuda-last", StackKind::Last, "default"),
        mpi_environment("cuda-dev", StackKind::Dev, "default"),
        module_environment("default-current", StackKind::Current),
        module_environment("default-last", StackKind::Last),
        module_environment("default-dev", StackKind::Dev),
    ]
}
