use anyhow::{Context, Result};
use clap::Args;
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use super::output::print_json;
use super::table_format::display_table_with_count;
use super::{SelectionArgs, build_plan};
use crate::config::RegressConfig;
use crate::pipeline::Orchestrator;
use crate::report::RunReport;

#[derive(Args, Debug, Clone)]
#[command(after_long_help = "\
EXAMPLES:
    # Run everything that applies to the current system
    hpc-regress run

    # Run the STREAM suite on Casper, at most 2 instances at a time
    hpc-regress --system casper run -c suites/stream --max-concurrent 2

    # Write the report to a fixed file
    hpc-regress run -t quick --report reports/quick.json
")]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Stage root (defaults to general.stage_dir)
    #[arg(long, value_name = "DIR")]
    pub stage_dir: Option<PathBuf>,

    /// Report file (defaults to general.report_file)
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Maximum number of instances in flight
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Seconds between job status polls
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<f64>,
}

/// Raise `flag` on the first SIGINT or SIGTERM
pub fn install_signal_handler(flag: Arc<AtomicBool>) -> Result<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let name = if sig == SIGINT { "SIGINT" } else { "SIGTERM" };
            warn!("Received {}. Stopping the session.", name);
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

fn print_summary(report: &RunReport) {
    display_table_with_count(&report.summary_rows(), "instances");
    println!(
        "Passed: {}  Failed: {}",
        report.summary.passed, report.summary.failed
    );
    for (kind, count) in &report.summary.failures {
        println!("  {}: {}", kind, count);
    }
}

/// Run the selected checks. Returns whether every instance passed.
pub fn handle_run(
    config: &RegressConfig,
    system: Option<&str>,
    args: &RunArgs,
    format: &str,
) -> Result<bool> {
    let plan = build_plan(config, system, &args.selection, args.stage_dir.as_deref())?;
    let mut runner = config.runner.clone();
    if let Some(n) = args.max_concurrent {
        runner.max_concurrent = n;
    }
    if let Some(secs) = args.poll_interval {
        runner.poll_interval = secs;
    }

    let orchestrator = Orchestrator::new(plan, runner);
    install_signal_handler(orchestrator.get_termination_flag())?;
    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| config.general.report_path(orchestrator.session_id()));

    let report = orchestrator.run()?;
    report.write(&report_path)?;
    info!("Report: {}", report_path.display());

    if format == "json" {
        print_json(&report, "run report");
    } else {
        print_summary(&report);
        println!("Report written to {}", report_path.display());
    }
    Ok(report.all_passed())
}
