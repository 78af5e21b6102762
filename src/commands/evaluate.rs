use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use super::output::print_json;
use super::table_format::display_table_with_count;
use super::{SelectionArgs, stage_root};
use crate::config::RegressConfig;
use crate::pipeline::{Resolver, StageLayout, TestInstance};
use crate::validate::{Evaluation, evaluate_output};

#[derive(Args, Debug, Clone)]
#[command(after_long_help = "\
EXAMPLES:
    # Re-check the captured output of a finished stage
    hpc-regress --system casper evaluate CM1QuickTest --environ gnu

    # Evaluate files copied elsewhere
    hpc-regress evaluate STREAMQuickTest --dir /tmp/stream-run
")]
pub struct EvaluateArgs {
    /// Check whose sanity and performance rules are applied
    pub check: String,

    /// Suite file or directory to load checks from (repeatable)
    #[arg(short = 'c', long = "checkpath", value_name = "PATH")]
    pub checkpath: Vec<PathBuf>,

    /// Partition of the instance (first applicable when omitted)
    #[arg(short, long)]
    pub partition: Option<String>,

    /// Environment of the instance (first applicable when omitted)
    #[arg(short, long)]
    pub environ: Option<String>,

    /// Parameter value of the instance as NAME=VALUE (repeatable)
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Directory holding the captured files (defaults to the instance's stage)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Stage root used to locate the instance's stage
    #[arg(long, value_name = "DIR")]
    pub stage_dir: Option<PathBuf>,
}

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Reference")]
    reference: String,
    #[tabled(rename = "Classification")]
    classification: String,
}

#[derive(Serialize)]
struct EvaluationDocument<'a> {
    instance: &'a str,
    directory: PathBuf,
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    evaluation: &'a Evaluation,
}

fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("Invalid --param '{}': expected NAME=VALUE", p))
        })
        .collect()
}

fn pick_instance(instances: Vec<TestInstance>, args: &EvaluateArgs) -> Result<TestInstance> {
    let params = parse_params(&args.params)?;
    instances
        .into_iter()
        .find(|i| {
            args.partition.as_ref().is_none_or(|p| &i.partition.name == p)
                && args.environ.as_ref().is_none_or(|e| &i.environ.name == e)
                && params.iter().all(|(k, v)| {
                    i.parameters.get(k).is_some_and(|value| value.to_string() == *v)
                })
        })
        .with_context(|| format!("No instance of {} matches the given options", args.check))
}

/// Evaluate one instance's captured output. Returns whether it passed.
pub fn handle_evaluate(
    config: &RegressConfig,
    system: Option<&str>,
    args: &EvaluateArgs,
    format: &str,
) -> Result<bool> {
    let system = config.select_system(system)?;
    let selection = SelectionArgs {
        checkpath: args.checkpath.clone(),
        ..Default::default()
    };
    let registry = selection.load_registry(config)?;
    let Some(definition) = registry.get(&args.check) else {
        bail!("Unknown check '{}'", args.check);
    };
    let root = stage_root(config, args.stage_dir.as_deref())?;
    let instances = Resolver::new(config, system)
        .with_stage_root(root)
        .resolve(definition)?;
    let instance = pick_instance(instances, args)?;

    let dir = args.dir.clone().unwrap_or_else(|| instance.stage_dir.clone());
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let layout = StageLayout::new(&dir);
    let output = if instance.is_compile_only() {
        layout.captured_build_output()
    } else {
        layout.captured_output()
    };
    let evaluation = evaluate_output(
        &instance.sanity,
        &instance.performance,
        &output,
        &instance.numeric_parameters,
        &instance.references,
    );
    let failure = evaluation.failure();

    if format == "json" {
        print_json(
            &EvaluationDocument {
                instance: &instance.name,
                directory: dir,
                passed: failure.is_none(),
                failure: failure.as_ref().map(|e| format!("{}: {}", e.kind(), e)),
                evaluation: &evaluation,
            },
            "evaluation",
        );
        return Ok(failure.is_none());
    }

    println!("{} ({})", instance.name, dir.display());
    let rules: Vec<RuleRow> = evaluation
        .sanity
        .results
        .iter()
        .map(|r| RuleRow {
            rule: r.rule.clone(),
            result: if r.passed { "pass" } else { "fail" }.to_string(),
            message: r.message.clone().unwrap_or_default(),
        })
        .collect();
    display_table_with_count(&rules, "sanity rules");
    let metrics: Vec<MetricRow> = evaluation
        .metrics
        .iter()
        .map(|m| MetricRow {
            name: m.name.clone(),
            value: match m.value {
                Some(v) => format!("{} {}", v, m.unit),
                None => m.error.clone().unwrap_or_else(|| "n/a".to_string()),
            },
            reference: m
                .reference
                .as_ref()
                .map(|r| format!("{} ({:?}, {:?})", r.value, r.lower, r.upper))
                .unwrap_or_default(),
            classification: m
                .classification
                .map(|c| c.to_string())
                .unwrap_or_default(),
        })
        .collect();
    if !metrics.is_empty() {
        display_table_with_count(&metrics, "metrics");
    }
    match &failure {
        Some(err) => println!("FAIL {}: {}", err.kind(), err),
        None => println!("PASS"),
    }
    Ok(failure.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let parsed = parse_params(&["pcols=16".to_string(), "nx = 64".to_string()]).unwrap();
        assert_eq!(parsed[0], ("pcols".to_string(), "16".to_string()));
        assert_eq!(parsed[1], ("nx".to_string(), "64".to_string()));
        assert!(parse_params(&["pcols".to_string()]).is_err());
    }
}
