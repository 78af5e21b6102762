use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tabled::Tabled;

use super::output::print_json;
use super::table_format::display_table_with_count;
use super::{SelectionArgs, build_plan};
use crate::config::RegressConfig;
use crate::pipeline::ExecutionPlan;

#[derive(Args, Debug, Clone)]
#[command(after_long_help = "\
EXAMPLES:
    # What would run on Casper
    hpc-regress --system casper plan

    # Dependency levels of the CM1 suite as JSON
    hpc-regress -f json plan -c suites/cm1
")]
pub struct PlanArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Stage root to show instead of the configured one
    #[arg(long, value_name = "DIR")]
    pub stage_dir: Option<PathBuf>,
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Instance")]
    name: String,
    #[tabled(rename = "Shape")]
    shape: String,
    #[tabled(rename = "Depends On")]
    depends_on: String,
    #[tabled(rename = "Stage")]
    stage: String,
}

#[derive(Debug, Serialize)]
struct PlannedInstance {
    name: String,
    check: String,
    partition: String,
    environ: String,
    level: usize,
    stage_dir: PathBuf,
    depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PlanDocument {
    system: String,
    instances: Vec<PlannedInstance>,
    /// Instance -> reason it cannot run
    unresolved: BTreeMap<String, String>,
    /// Check -> reason it produced no instances
    rejected: BTreeMap<String, String>,
}

fn plan_document(plan: &mut ExecutionPlan) -> Result<PlanDocument> {
    let levels = plan.levels()?;
    let edges = plan.graph.edges();
    let mut instances = Vec::with_capacity(plan.len());
    for (level, names) in levels.iter().enumerate() {
        for name in names {
            let Some(instance) = plan.get(name) else {
                continue;
            };
            instances.push(PlannedInstance {
                name: instance.name.clone(),
                check: instance.check.clone(),
                partition: instance.partition.name.clone(),
                environ: instance.environ.name.clone(),
                level,
                stage_dir: instance.stage_dir.clone(),
                depends_on: edges.get(name).cloned().unwrap_or_default(),
            });
        }
    }
    Ok(PlanDocument {
        system: plan.system.clone(),
        instances,
        unresolved: plan
            .unresolved
            .iter()
            .map(|u| (u.instance.clone(), u.error.to_string()))
            .collect(),
        rejected: plan
            .rejected
            .iter()
            .map(|(check, err)| (check.clone(), err.to_string()))
            .collect(),
    })
}

pub fn handle_plan(
    config: &RegressConfig,
    system: Option<&str>,
    args: &PlanArgs,
    format: &str,
) -> Result<()> {
    let mut plan = build_plan(config, system, &args.selection, args.stage_dir.as_deref())?;
    let document = plan_document(&mut plan)?;

    if format == "json" {
        print_json(&document, "plan");
        return Ok(());
    }
    println!("Plan for system {}:", document.system);
    let rows: Vec<PlanRow> = document
        .instances
        .iter()
        .map(|i| PlanRow {
            level: i.level,
            name: i.name.clone(),
            shape: plan
                .get(&i.name)
                .map(|inst| {
                    match (inst.build.is_some(), inst.run.is_some()) {
                        (true, true) => "build+run",
                        (true, false) => "build",
                        _ => "run",
                    }
                    .to_string()
                })
                .unwrap_or_default(),
            depends_on: i.depends_on.join("\n"),
            stage: i.stage_dir.display().to_string(),
        })
        .collect();
    display_table_with_count(&rows, "instances");
    for (name, reason) in &document.unresolved {
        println!("Unresolved: {}: {}", name, reason);
    }
    for (check, reason) in &document.rejected {
        println!("Rejected: {}: {}", check, reason);
    }
    Ok(())
}
