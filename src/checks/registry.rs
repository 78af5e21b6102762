use anyhow::{Context, Result, bail};
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::definition::TestDefinition;
use super::spec::LoadedSuite;

const SUITE_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "json5", "toml"];

fn is_suite_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUITE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Suite files under `root`, sorted. A file path is returned as is.
pub fn discover_suite_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        warn!("Check search path {} does not exist", root.display());
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                // src/ holds sources for the checks, not suites
                if recursive && path.file_name().is_some_and(|n| n != "src") {
                    pending.push(path);
                }
            } else if is_suite_file(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Selection applied by `list`, `plan` and `run`
#[derive(Debug, Clone, Default)]
pub struct CheckFilter {
    /// Keep checks carrying any of these tags
    pub tags: Vec<String>,
    /// Keep checks whose name matches any of these patterns
    pub names: Vec<Regex>,
    /// Drop checks whose name matches any of these patterns
    pub exclude: Vec<Regex>,
}

impl CheckFilter {
    pub fn new(tags: &[String], names: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("Invalid name pattern '{}'", p)))
                .collect()
        };
        Ok(Self {
            tags: tags.to_vec(),
            names: compile(names)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn matches(&self, definition: &TestDefinition) -> bool {
        let tag_ok = self.tags.is_empty() || self.tags.iter().any(|t| definition.has_tag(t));
        let name_ok =
            self.names.is_empty() || self.names.iter().any(|r| r.is_match(&definition.name));
        let excluded = self.exclude.iter().any(|r| r.is_match(&definition.name));
        tag_ok && name_ok && !excluded
    }
}

/// Every check of every loaded suite, by name
#[derive(Debug, Clone, Default)]
pub struct CheckRegistry {
    suites: Vec<LoadedSuite>,
    by_name: BTreeMap<String, (usize, usize)>,
}

impl CheckRegistry {
    /// Load every suite file found under `paths`. Check names must be unique
    /// across suites since dependencies refer to them by name.
    pub fn load(paths: &[PathBuf], recursive: bool) -> Result<Self> {
        let mut registry = CheckRegistry::default();
        for root in paths {
            for file in discover_suite_files(root, recursive)? {
                debug!("Loading suite file {}", file.display());
                registry.add(LoadedSuite::load(&file)?)?;
            }
        }
        Ok(registry)
    }

    pub fn add(&mut self, suite: LoadedSuite) -> Result<()> {
        let suite_index = self.suites.len();
        for (index, definition) in suite.definitions.iter().enumerate() {
            if let Some((other, _)) = self.by_name.get(&definition.name) {
                bail!(
                    "Check '{}' in {} is already defined in {}",
                    definition.name,
                    suite.path.display(),
                    self.suites[*other].path.display()
                );
            }
            self.by_name
                .insert(definition.name.clone(), (suite_index, index));
        }
        self.suites.push(suite);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TestDefinition> {
        self.by_name
            .get(name)
            .map(|(s, i)| &self.suites[*s].definitions[*i])
    }

    /// All checks in file order
    pub fn definitions(&self) -> impl Iterator<Item = &TestDefinition> {
        self.suites.iter().flat_map(|s| s.definitions.iter())
    }

    /// Checks selected by `filter`, plus every check they depend on
    /// (transitively) so the plan stays complete
    pub fn select(&self, filter: &CheckFilter) -> Vec<&TestDefinition> {
        let mut wanted: Vec<&str> = self
            .definitions()
            .filter(|d| filter.matches(d))
            .map(|d| d.name.as_str())
            .collect();
        let mut index = 0;
        while index < wanted.len() {
            if let Some(def) = self.get(wanted[index]) {
                for dep in &def.depends_on {
                    if !wanted.contains(&dep.as_str()) && self.get(dep).is_some() {
                        wanted.push(dep.as_str());
                    }
                }
            }
            index += 1;
        }
        self.definitions()
            .filter(|d| wanted.contains(&d.name.as_str()))
            .collect()
    }

    pub fn suites(&self) -> &[LoadedSuite] {
        &self.suites
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
