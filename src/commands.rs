//! Command handlers behind the `hpc-regress` subcommands.
//!
//! Every handler takes the loaded site configuration plus its own arguments
//! and honours the global `--format` (`table` or `json`).

pub mod config;
pub mod evaluate;
pub mod list;
pub mod output;
pub mod plan;
pub mod run;
pub mod table_format;

use anyhow::{Context, Result, bail};
use clap::Args;
use log::debug;
use std::env;
use std::path::{Path, PathBuf};

use crate::checks::{CheckFilter, CheckRegistry, TestDefinition};
use crate::config::RegressConfig;
use crate::pipeline::ExecutionPlan;

/// Where checks are loaded from and which of them are kept
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Suite file or directory to load checks from (repeatable). Defaults to
    /// the configured search path.
    #[arg(short = 'c', long = "checkpath", value_name = "PATH")]
    pub checkpath: Vec<PathBuf>,

    /// Search check paths recursively even if the configuration says otherwise
    #[arg(short = 'R', long)]
    pub recursive: bool,

    /// Keep checks carrying this tag (repeatable)
    #[arg(short = 't', long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Keep checks whose name matches this regex (repeatable)
    #[arg(short = 'n', long = "name", value_name = "PATTERN")]
    pub names: Vec<String>,

    /// Drop checks whose name matches this regex (repeatable)
    #[arg(short = 'x', long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,
}

impl SelectionArgs {
    pub fn search_paths(&self, config: &RegressConfig) -> Vec<PathBuf> {
        if self.checkpath.is_empty() {
            config.general.search_paths()
        } else {
            self.checkpath.clone()
        }
    }

    pub fn load_registry(&self, config: &RegressConfig) -> Result<CheckRegistry> {
        let paths = self.search_paths(config);
        let recursive = self.recursive || config.general.check_search_recursive;
        debug!("Loading checks from {:?} recursive={}", paths, recursive);
        CheckRegistry::load(&paths, recursive)
    }

    pub fn filter(&self) -> Result<CheckFilter> {
        CheckFilter::new(&self.tags, &self.names, &self.exclude)
    }
}

/// Load the registry and apply the selection, failing when nothing is left
pub fn selected_definitions(
    registry: &CheckRegistry,
    selection: &SelectionArgs,
) -> Result<Vec<TestDefinition>> {
    let filter = selection.filter()?;
    let selected: Vec<TestDefinition> = registry.select(&filter).into_iter().cloned().collect();
    if selected.is_empty() {
        bail!("No checks selected");
    }
    Ok(selected)
}

/// Absolute stage root: `override_dir` when given, else the configured one
pub fn stage_root(config: &RegressConfig, override_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = override_dir.unwrap_or(&config.general.stage_dir);
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = env::current_dir().context("Failed to get the current directory")?;
    Ok(cwd.join(dir))
}

/// Select checks and resolve them on `system` (detected from the hostname
/// when not given)
pub fn build_plan(
    config: &RegressConfig,
    system: Option<&str>,
    selection: &SelectionArgs,
    stage_dir: Option<&Path>,
) -> Result<ExecutionPlan> {
    let system = config.select_system(system)?;
    let registry = selection.load_registry(config)?;
    let definitions = selected_definitions(&registry, selection)?;
    let root = stage_root(config, stage_dir)?;
    ExecutionPlan::build(config, system, &definitions, Some(root))
        .with_context(|| format!("Cannot plan checks on system '{}'", system.name))
}
