//! Execution plan: resolved instances plus the dependency graph linking them

use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use super::graph::{DependencyGraph, UnresolvedDependency};
use super::resolver::{Resolver, TestInstance};
use crate::checks::TestDefinition;
use crate::config::{RegressConfig, SystemConfig};
use crate::errors::PipelineError;

#[derive(Debug)]
pub struct ExecutionPlan {
    pub system: String,
    /// In resolution order
    pub instances: Vec<TestInstance>,
    pub graph: DependencyGraph,
    /// Instances that cannot run: a dependency has no matching instance,
    /// sits on a cycle, or waits for one
    pub unresolved: Vec<UnresolvedDependency>,
    /// Checks that could not be resolved at all
    pub rejected: Vec<(String, PipelineError)>,
    index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Resolve `definitions` on `system` and link their dependencies.
    /// Instances on a dependency cycle fail alone; the rest of the plan
    /// still runs.
    pub fn build<'d, I>(
        config: &RegressConfig,
        system: &SystemConfig,
        definitions: I,
        stage_root: Option<PathBuf>,
    ) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = &'d TestDefinition>,
    {
        let mut resolver = Resolver::new(config, system);
        if let Some(root) = stage_root {
            resolver = resolver.with_stage_root(root);
        }
        let resolution = resolver.resolve_all(definitions);
        Self::from_instances(&system.name, resolution.instances, resolution.rejected)
    }

    pub fn from_instances(
        system: &str,
        instances: Vec<TestInstance>,
        rejected: Vec<(String, PipelineError)>,
    ) -> Result<Self, PipelineError> {
        let mut seen = HashMap::new();
        for (i, instance) in instances.iter().enumerate() {
            if seen.insert(instance.name.clone(), i).is_some() {
                return Err(PipelineError::Configuration(format!(
                    "duplicate instance '{}'",
                    instance.name
                )));
            }
        }
        let (mut graph, mut unresolved) = DependencyGraph::from_instances(&instances);
        detach_cycles(&mut graph, &mut unresolved);
        for item in &unresolved {
            debug!("Unresolved dependency for {}: {}", item.instance, item.error);
        }
        info!(
            "Plan for system={}: {} instances, {} rejected checks",
            system,
            instances.len(),
            rejected.len()
        );
        Ok(Self {
            system: system.to_string(),
            instances,
            graph,
            unresolved,
            rejected,
            index: seen,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TestInstance> {
        self.index.get(name).map(|i| &self.instances[*i])
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance names grouped by dependency depth
    pub fn levels(&mut self) -> Result<Vec<Vec<String>>, PipelineError> {
        Ok(self.graph.topological_levels()?.clone())
    }
}

/// Move instances on a cycle, and everything waiting for them, out of the
/// schedulable graph and into `unresolved`
fn detach_cycles(graph: &mut DependencyGraph, unresolved: &mut Vec<UnresolvedDependency>) {
    let cyclic = graph.cyclic_instances();
    if cyclic.is_empty() {
        return;
    }
    warn!("Dependency cycle among: {}", cyclic.join(", "));
    let on_cycle: BTreeSet<&String> = cyclic.iter().collect();
    let mut affected: Vec<(String, PipelineError)> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for name in &cyclic {
        if seen.insert(name.clone()) {
            affected.push((
                name.clone(),
                PipelineError::Configuration(format!(
                    "dependency cycle among: {}",
                    cyclic.join(", ")
                )),
            ));
        }
    }
    for name in &cyclic {
        for dependent in graph.transitive_dependents(name) {
            if on_cycle.contains(&dependent) || !seen.insert(dependent.clone()) {
                continue;
            }
            affected.push((
                dependent,
                PipelineError::Configuration(format!(
                    "waits for instances on a dependency cycle ({})",
                    name
                )),
            ));
        }
    }
    for (name, _) in &affected {
        graph.detach(name);
    }
    let already: BTreeSet<String> = unresolved.iter().map(|u| u.instance.clone()).collect();
    unresolved.extend(
        affected
            .into_iter()
            .filter(|(name, _)| !already.contains(name))
            .map(|(instance, error)| UnresolvedDependency { instance, error }),
    );
}
