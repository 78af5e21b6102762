use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use super::output::print_json_wrapped;
use super::table_format::display_table_with_count;
use super::{SelectionArgs, selected_definitions};
use crate::checks::TestDefinition;
use crate::config::RegressConfig;

#[derive(Args, Debug, Clone)]
#[command(after_long_help = "\
EXAMPLES:
    # Every check on the search path
    hpc-regress list

    # Only the quick CM1 checks
    hpc-regress list -t quick -n '^CM1'

    # JSON for scripting
    hpc-regress -f json list -c suites/stream
")]
pub struct ListArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Check")]
    name: String,
    #[tabled(rename = "Suite")]
    suite: String,
    #[tabled(rename = "Shape")]
    shape: String,
    #[tabled(rename = "Systems")]
    systems: String,
    #[tabled(rename = "Environs")]
    environs: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Depends On")]
    depends_on: String,
}

/// Machine-readable listing entry
#[derive(Debug, Serialize)]
pub struct CheckSummary {
    pub name: String,
    pub suite: String,
    pub descr: String,
    pub shape: String,
    pub valid_systems: Vec<String>,
    pub valid_prog_environs: Vec<String>,
    pub tags: Vec<String>,
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourcesdir: Option<PathBuf>,
}

impl From<&TestDefinition> for CheckSummary {
    fn from(def: &TestDefinition) -> Self {
        Self {
            name: def.name.clone(),
            suite: def.suite.clone(),
            descr: def.descr.clone(),
            shape: def.shape.name().to_string(),
            valid_systems: def.valid_systems.clone(),
            valid_prog_environs: def.valid_prog_environs.clone(),
            tags: def.tags.iter().cloned().collect(),
            depends_on: def.depends_on.clone(),
            sourcesdir: def.sourcesdir.clone(),
        }
    }
}

pub fn handle_list(config: &RegressConfig, args: &ListArgs, format: &str) -> Result<()> {
    let registry = args.selection.load_registry(config)?;
    let definitions = selected_definitions(&registry, &args.selection)?;
    let summaries: Vec<CheckSummary> = definitions.iter().map(CheckSummary::from).collect();

    if format == "json" {
        print_json_wrapped("checks", &summaries, "checks");
        return Ok(());
    }
    let rows: Vec<CheckRow> = summaries
        .into_iter()
        .map(|s| CheckRow {
            name: s.name,
            suite: s.suite,
            shape: s.shape,
            systems: s.valid_systems.join(" "),
            environs: s.valid_prog_environs.join(" "),
            tags: s.tags.join(" "),
            depends_on: s.depends_on.join(" "),
        })
        .collect();
    display_table_with_count(&rows, "checks");
    Ok(())
}
