use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;

use super::output::print_json;
use crate::config::{ConfigPaths, RegressConfig};

#[derive(clap::Subcommand, Debug, Clone)]
#[command(after_long_help = "\
EXAMPLES:
    # Effective configuration after layering every file
    hpc-regress config show

    # Start a site file from the built-in Casper profile
    hpc-regress config generate -o hpc-regress.toml

    # Check a configuration before using it
    hpc-regress --config site.toml config validate
")]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print (or write) the built-in configuration as TOML
    Generate {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the effective configuration and report every problem
    Validate,
    /// List the configuration files that were found
    Paths,
}

/// Returns false when validation found problems
pub fn handle_config_commands(
    config: &RegressConfig,
    command: &ConfigCommands,
    format: &str,
) -> Result<bool> {
    match command {
        ConfigCommands::Show => {
            if format == "json" {
                print_json(config, "configuration");
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(true)
        }
        ConfigCommands::Generate { output, force } => {
            let content = RegressConfig::generate_default_config();
            match output {
                Some(path) => {
                    if path.exists() && !force {
                        bail!("{} exists; pass --force to overwrite", path.display());
                    }
                    fs::write(path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(true)
        }
        ConfigCommands::Validate => match config.validate() {
            Ok(()) => {
                if format == "json" {
                    print_json(&serde_json::json!({ "valid": true, "errors": [] }), "validation");
                } else {
                    println!("Configuration is valid");
                }
                Ok(true)
            }
            Err(errors) => {
                if format == "json" {
                    print_json(
                        &serde_json::json!({ "valid": false, "errors": errors }),
                        "validation",
                    );
                } else {
                    eprintln!("Configuration has {} problem(s):", errors.len());
                    for error in &errors {
                        eprintln!("  - {}", error);
                    }
                }
                Ok(false)
            }
        },
        ConfigCommands::Paths => {
            let paths = ConfigPaths::new();
            let mut candidates = vec![paths.system.clone()];
            candidates.extend(paths.user.clone());
            candidates.push(paths.local.clone());
            for path in candidates {
                let marker = if path.exists() { "found" } else { "missing" };
                println!("{:8} {}", marker, path.display());
            }
            Ok(true)
        }
    }
}
