//! Dependency graph over resolved test instances.
//!
//! Checks name their dependencies by check name; the graph links each
//! instance to the instances of that check that share its partition and
//! programming environment. Instances on a cycle, and everything waiting
//! for them, are detached before anything runs.

use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::resolver::TestInstance;
use crate::errors::PipelineError;

/// Directed acyclic graph of instance names
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Instance names in resolution order
    nodes: Vec<String>,
    /// Instance -> instances it waits for
    depends_on: HashMap<String, HashSet<String>>,
    /// Instance -> instances waiting for it
    depended_by: HashMap<String, HashSet<String>>,
    /// Cached topological levels
    levels: Option<Vec<Vec<String>>>,
}

/// An instance whose declared dependency has no matching instance
#[derive(Debug)]
pub struct UnresolvedDependency {
    pub instance: String,
    pub error: PipelineError,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for a set of instances.
    ///
    /// A dependency resolves to every instance of the named check on the
    /// same partition and environment. Instances whose dependency resolves
    /// to nothing stay in the graph without that edge and are returned
    /// separately so the orchestrator can fail them.
    pub fn from_instances(instances: &[TestInstance]) -> (Self, Vec<UnresolvedDependency>) {
        let mut graph = Self::new();
        for instance in instances {
            graph.add_node(&instance.name);
        }

        let mut by_case: HashMap<(&str, &str, &str), Vec<&str>> = HashMap::new();
        for instance in instances {
            by_case
                .entry((
                    instance.check.as_str(),
                    instance.partition.name.as_str(),
                    instance.environ.name.as_str(),
                ))
                .or_default()
                .push(instance.name.as_str());
        }

        let mut unresolved = Vec::new();
        for instance in instances {
            for dependency in &instance.depends_on {
                let key = (
                    dependency.as_str(),
                    instance.partition.name.as_str(),
                    instance.environ.name.as_str(),
                );
                match by_case.get(&key) {
                    Some(targets) => {
                        for target in targets {
                            graph.add_edge(&instance.name, target);
                        }
                    }
                    None => unresolved.push(UnresolvedDependency {
                        instance: instance.name.clone(),
                        error: PipelineError::Configuration(format!(
                            "dependency '{}' has no instance on {}:{}+{}",
                            dependency,
                            instance.system,
                            instance.partition.name,
                            instance.environ.name
                        )),
                    }),
                }
            }
        }
        (graph, unresolved)
    }

    pub fn add_node(&mut self, name: &str) {
        if self.depends_on.contains_key(name) {
            return;
        }
        self.nodes.push(name.to_string());
        self.depends_on.insert(name.to_string(), HashSet::new());
        self.depended_by.insert(name.to_string(), HashSet::new());
        self.levels = None;
    }

    /// `dependent` waits for `dependency`. Both nodes are added if missing.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) {
        self.add_node(dependent);
        self.add_node(dependency);
        debug!("Dependency edge {} -> {}", dependent, dependency);
        if let Some(deps) = self.depends_on.get_mut(dependent) {
            deps.insert(dependency.to_string());
        }
        if let Some(users) = self.depended_by.get_mut(dependency) {
            users.insert(dependent.to_string());
        }
        self.levels = None;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.depends_on.contains_key(name)
    }

    pub fn has_dependencies(&self, name: &str) -> bool {
        self.depends_on
            .get(name)
            .map(|deps| !deps.is_empty())
            .unwrap_or(false)
    }

    /// The instances `name` waits for
    pub fn dependencies_of(&self, name: &str) -> Option<&HashSet<String>> {
        self.depends_on.get(name)
    }

    /// Group instances by dependency depth (Kahn's algorithm).
    ///
    /// Level 0 holds instances without dependencies; level N holds
    /// instances whose dependencies all sit in lower levels. Within a level
    /// the resolution order is kept.
    pub fn topological_levels(&mut self) -> Result<&Vec<Vec<String>>, PipelineError> {
        if self.levels.is_none() {
            let (levels, cyclic) = self.compute_levels();
            if !cyclic.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "dependency cycle among: {}",
                    cyclic.join(", ")
                )));
            }
            self.levels = Some(levels);
        }
        match &self.levels {
            Some(levels) => Ok(levels),
            None => Err(PipelineError::Configuration(
                "dependency levels unavailable".to_string(),
            )),
        }
    }

    /// Levels of the acyclic part plus the instances left with unmet
    /// dependencies (on a cycle or behind one), in resolution order
    fn compute_levels(&self) -> (Vec<Vec<String>>, Vec<String>) {
        let position: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.depends_on[n].len()))
            .collect();

        let mut queue: VecDeque<(&str, usize)> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.as_str()] == 0)
            .map(|n| (n.as_str(), 0))
            .collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut visited = 0;
        while let Some((name, level)) = queue.pop_front() {
            visited += 1;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(name.to_string());

            let mut released: Vec<&str> = Vec::new();
            for user in &self.depended_by[name] {
                if let Some(degree) = in_degree.get_mut(user.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        released.push(user.as_str());
                    }
                }
            }
            released.sort_by_key(|n| position[n]);
            queue.extend(released.into_iter().map(|n| (n, level + 1)));
        }

        let mut blocked: Vec<&str> = Vec::new();
        if visited < self.nodes.len() {
            blocked = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            blocked.sort_by_key(|n| position[n]);
        }

        for level in &mut levels {
            level.sort_by_key(|n| position[n.as_str()]);
        }
        (levels, blocked.into_iter().map(str::to_string).collect())
    }

    /// Flattened topological order
    pub fn topological_order(&mut self) -> Result<Vec<String>, PipelineError> {
        Ok(self.topological_levels()?.iter().flatten().cloned().collect())
    }

    /// Instances that sit on a dependency cycle. Instances that only wait
    /// for a cycle are not included.
    pub fn cyclic_instances(&self) -> Vec<String> {
        let (_, blocked) = self.compute_levels();
        blocked
            .into_iter()
            .filter(|name| self.transitive_dependents(name).contains(name))
            .collect()
    }

    /// Drop every edge touching `name`; the node itself stays
    pub fn detach(&mut self, name: &str) {
        let deps = self
            .depends_on
            .get_mut(name)
            .map(std::mem::take)
            .unwrap_or_default();
        for dep in &deps {
            if let Some(users) = self.depended_by.get_mut(dep) {
                users.remove(name);
            }
        }
        let users = self
            .depended_by
            .get_mut(name)
            .map(std::mem::take)
            .unwrap_or_default();
        for user in &users {
            if let Some(deps) = self.depends_on.get_mut(user) {
                deps.remove(name);
            }
        }
        self.levels = None;
    }

    /// Every instance that directly or transitively waits for `name`
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            if let Some(users) = self.depended_by.get(current) {
                for user in users {
                    if found.insert(user.clone()) {
                        queue.push_back(user);
                    }
                }
            }
        }
        found
    }

    /// Dependency lists keyed by instance, sorted, for display
    pub fn edges(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .iter()
            .filter(|name| self.has_dependencies(name))
            .map(|name| {
                let mut deps: Vec<String> = self.depends_on[name].iter().cloned().collect();
                deps.sort();
                (name.clone(), deps)
            })
            .collect()
    }
}
