//! Configuration management for hpc-regress
//!
//! The site configuration describes the systems (with their partitions), the
//! programming environments, logging handlers, general options and runner
//! pacing. It is loaded once at startup and never mutated afterwards.
//!
//! Files are layered in priority order (later overrides earlier):
//! 1. System config: `/etc/hpc-regress/config.toml`
//! 2. User config: `$HOME/.config/hpc-regress/config.toml`
//! 3. Local config: `./hpc-regress.toml`
//! 4. Files passed with `--config`
//!
//! TOML, YAML, JSON and JSON5 are accepted; the format is chosen by file
//! extension. Tables merge key by key; arrays are replaced wholesale.

pub mod casper;
pub mod general;
pub mod logging;
pub mod site;

pub use general::{GeneralConfig, RunnerConfig, expand_env_vars};
pub use logging::{HandlerKind, LogHandler, LoggingConfig, parse_level};
pub use site::{
    CompilerTriplet, EnvironmentConfig, LauncherKind, ModulesSystem, PartitionConfig,
    ResourceTemplate, SchedulerKind, SystemConfig,
};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Standard configuration file locations
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: Option<PathBuf>,
    pub local: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPaths {
    pub fn new() -> Self {
        let user = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .map(|dir| dir.join("hpc-regress").join("config.toml"));
        Self {
            system: PathBuf::from("/etc/hpc-regress/config.toml"),
            user,
            local: PathBuf::from("hpc-regress.toml"),
        }
    }

    /// Paths that exist, lowest priority first
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.system.clone()];
        if let Some(user) = &self.user {
            paths.push(user.clone());
        }
        paths.push(self.local.clone());
        paths.into_iter().filter(|p| p.exists()).collect()
    }
}

/// Complete site configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressConfig {
    pub systems: Vec<SystemConfig>,
    pub environments: Vec<EnvironmentConfig>,
    pub logging: LoggingConfig,
    pub general: GeneralConfig,
    pub runner: RunnerConfig,
}

impl RegressConfig {
    /// The built-in NCAR Casper site
    pub fn builtin() -> Self {
        Self {
            systems: vec![casper::casper_system()],
            environments: casper::casper_environments(),
            ..Default::default()
        }
    }

    /// Load from the standard locations plus `extra` files. Falls back to
    /// the built-in site when no file declares any system.
    pub fn load(extra: &[PathBuf]) -> Result<Self> {
        Self::load_with_paths(&ConfigPaths::new(), extra)
    }

    pub fn load_with_paths(paths: &ConfigPaths, extra: &[PathBuf]) -> Result<Self> {
        let mut files = paths.existing_paths();
        files.extend(extra.iter().cloned());
        if files.is_empty() {
            return Ok(Self::builtin());
        }
        let mut config = Self::load_from_files(&files)?;
        if config.systems.is_empty() {
            let builtin = Self::builtin();
            config.systems = builtin.systems;
            if config.environments.is_empty() {
                config.environments = builtin.environments;
            }
        }
        Ok(config)
    }

    /// Load and merge the given files, lowest priority first
    pub fn load_from_files(files: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::Value::Object(serde_json::Map::new());
        for file in files {
            let value = read_config_value(file)?;
            merge_values(&mut merged, value);
        }
        serde_json::from_value(merged).context("Invalid configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_from_files(&[path.as_ref().to_path_buf()])
    }

    pub fn get_system(&self, name: &str) -> Option<&SystemConfig> {
        self.systems.iter().find(|s| s.name == name)
    }

    pub fn get_environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// The first system whose hostname patterns match `hostname`
    pub fn detect_system(&self, hostname: &str) -> Option<&SystemConfig> {
        self.systems.iter().find(|s| s.matches_hostname(hostname))
    }

    /// Pick the active system: by name when given, otherwise by hostname
    pub fn select_system(&self, name: Option<&str>) -> Result<&SystemConfig> {
        if let Some(name) = name {
            return self.get_system(name).with_context(|| {
                format!(
                    "Unknown system '{}'. Known systems: {}",
                    name,
                    self.system_names().join(", ")
                )
            });
        }
        let host = hostname::get()
            .context("Failed to get hostname")?
            .to_string_lossy()
            .to_string();
        self.detect_system(&host).with_context(|| {
            format!(
                "No system matches hostname '{}'; pass --system (known: {})",
                host,
                self.system_names().join(", ")
            )
        })
    }

    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Validate the configuration and collect every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let mut env_names = HashSet::new();
        for environ in &self.environments {
            if environ.name.is_empty() {
                errors.push("environments: environment with empty name".to_string());
            }
            if !env_names.insert(environ.name.as_str()) {
                errors.push(format!(
                    "environments: duplicate environment '{}'",
                    environ.name
                ));
            }
        }

        let mut system_names = HashSet::new();
        for system in &self.systems {
            if !system_names.insert(system.name.as_str()) {
                errors.push(format!("systems: duplicate system '{}'", system.name));
            }
            for pattern in &system.hostnames {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!(
                        "systems.{}.hostnames: invalid pattern '{}': {}",
                        system.name, pattern, e
                    ));
                }
            }
            let mut partition_names = HashSet::new();
            for partition in &system.partitions {
                let prefix = format!("systems.{}.partitions.{}", system.name, partition.name);
                if !partition_names.insert(partition.name.as_str()) {
                    errors.push(format!(
                        "systems.{}: duplicate partition '{}'",
                        system.name, partition.name
                    ));
                }
                if partition.max_jobs == 0 {
                    errors.push(format!("{}.max_jobs must be at least 1", prefix));
                }
                for environ in &partition.environs {
                    if !env_names.contains(environ.as_str()) {
                        errors.push(format!(
                            "{}.environs: unknown environment '{}'",
                            prefix, environ
                        ));
                    }
                }
                let mut resource_names = HashSet::new();
                for resource in &partition.resources {
                    if !resource_names.insert(resource.name.as_str()) {
                        errors.push(format!(
                            "{}.resources: duplicate resource '{}'",
                            prefix, resource.name
                        ));
                    }
                }
            }
        }

        if parse_level(&self.logging.level).is_none() {
            errors.push(format!("logging.level: unknown level '{}'", self.logging.level));
        }
        for handler in &self.logging.handlers {
            if parse_level(&handler.level).is_none() {
                errors.push(format!(
                    "logging.handlers.{}: unknown level '{}'",
                    handler.name, handler.level
                ));
            }
            if handler.kind == HandlerKind::Stream
                && handler.name != "stdout"
                && handler.name != "stderr"
            {
                errors.push(format!(
                    "logging.handlers.{}: stream handlers must be 'stdout' or 'stderr'",
                    handler.name
                ));
            }
        }

        if self.general.report_file.trim().is_empty() {
            errors.push("general.report_file must not be empty".to_string());
        }
        if self.runner.poll_interval <= 0.0 {
            errors.push("runner.poll_interval must be positive".to_string());
        }
        if self.runner.max_concurrent == 0 {
            errors.push("runner.max_concurrent must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// A commented TOML rendering of the built-in site, suitable as a starting point
    pub fn generate_default_config() -> String {
        let body = Self::builtin()
            .to_toml()
            .unwrap_or_else(|e| format!("# failed to render configuration: {}\n", e));
        format!(
            "# hpc-regress site configuration\n\
             #\n\
             # Place this file at ~/.config/hpc-regress/config.toml or ./hpc-regress.toml\n\n{}",
            body
        )
    }
}

fn read_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();
    let value = match extension.as_str() {
        "json" => serde_json::from_str(&content)?,
        "json5" => json5::from_str(&content)?,
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))?,
    };
    Ok(value)
}

/// Merge `overlay` into `base`: objects merge recursively, everything else
/// is replaced.
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_is_valid() {
        let config = RegressConfig::builtin();
        assert!(config.validate().is_ok());
        assert_eq!(config.system_names(), vec!["casper"]);
        assert!(config.detect_system("casper-login2").is_some());
        assert!(config.detect_system("derecho1").is_none());
    }

    #[test]
    fn test_merge_values() {
        let mut base = json!({"runner": {"poll_interval": 30.0, "max_concurrent": 8}, "systems": [1, 2]});
        merge_values(
            &mut base,
            json!({"runner": {"poll_interval": 5.0}, "systems": [3]}),
        );
        assert_eq!(base["runner"]["poll_interval"], json!(5.0));
        assert_eq!(base["runner"]["max_concurrent"], json!(8));
        assert_eq!(base["systems"], json!([3]));
    }

    #[test]
    fn test_validate_unknown_environ() {
        let mut config = RegressConfig::builtin();
        config.systems[0].partitions[0]
            .environs
            .push("pgi".to_string());
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unknown environment 'pgi'")));
    }

    #[test]
    fn test_select_system_by_name() {
        let config = RegressConfig::builtin();
        assert_eq!(config.select_system(Some("casper")).unwrap().name, "casper");
        let err = config.select_system(Some("derecho")).unwrap_err();
        assert!(err.to_string().contains("casper"));
    }
}
