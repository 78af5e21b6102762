use clap::{Parser, Subcommand, builder::styling};
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;

use hpc_regress::commands::config::{ConfigCommands, handle_config_commands};
use hpc_regress::commands::evaluate::{EvaluateArgs, handle_evaluate};
use hpc_regress::commands::list::{ListArgs, handle_list};
use hpc_regress::commands::plan::{PlanArgs, handle_plan};
use hpc_regress::commands::run::{RunArgs, handle_run};
use hpc_regress::config::RegressConfig;
use hpc_regress::logging::init_logging;

const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::Green.on_default().bold())
    .usage(styling::AnsiColor::Green.on_default().bold())
    .literal(styling::AnsiColor::Cyan.on_default().bold())
    .placeholder(styling::AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "hpc-regress")]
#[command(version, about = "Regression checks for HPC applications", long_about = None)]
#[command(styles = STYLES)]
struct Cli {
    /// Extra configuration file, layered over the standard ones (repeatable)
    #[arg(short = 'C', long = "config", global = true, env = "HPC_REGRESS_CONFIG")]
    config: Vec<PathBuf>,

    /// System to run on (detected from the hostname when omitted)
    #[arg(short, long, global = true, env = "HPC_REGRESS_SYSTEM")]
    system: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table", value_parser = ["table", "json"])]
    format: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the checks found on the search path
    List(ListArgs),
    /// Show the instances that would run, grouped by dependency level
    Plan(PlanArgs),
    /// Build, run and validate the selected checks
    Run(RunArgs),
    /// Apply a check's sanity and performance rules to captured output
    Evaluate(EvaluateArgs),
    /// Inspect, generate or validate the site configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RegressConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.logging, cli.verbose) {
        eprintln!("Error initializing logging: {:#}", e);
        return ExitCode::FAILURE;
    }
    debug!("Loaded configuration with {} systems", config.systems.len());

    let system = cli.system.as_deref();
    let format = cli.format.as_str();
    let result = match &cli.command {
        Commands::List(args) => handle_list(&config, args, format).map(|()| true),
        Commands::Plan(args) => handle_plan(&config, system, args, format).map(|()| true),
        Commands::Run(args) => handle_run(&config, system, args, format),
        Commands::Evaluate(args) => handle_evaluate(&config, system, args, format),
        Commands::Config { command } => handle_config_commands(&config, command, format),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
