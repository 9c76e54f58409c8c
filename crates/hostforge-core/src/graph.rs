//! Task graph construction
//!
//! Each component expands into `prepare -> copy* -> install`. A component's
//! prepare step waits on the install step of every component it depends on.
//! Dependency problems are reported here, before any step runs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::component::Component;
use crate::error::GraphError;
use crate::model::StepId;

/// A step and the steps that must finish before it
#[derive(Debug, Clone)]
pub struct StepNode {
    /// Step identity
    pub id: StepId,
    /// Steps this one waits on
    pub predecessors: Vec<StepId>,
}

/// Validated, topologically ordered set of install steps
#[derive(Debug, Clone)]
pub struct TaskGraph {
    components: BTreeMap<String, Arc<Component>>,
    order: Vec<String>,
    steps: Vec<StepNode>,
    index: HashMap<StepId, usize>,
}

impl TaskGraph {
    /// Build the graph for a set of components
    ///
    /// # Errors
    /// Returns a `GraphError` for invalid or duplicate component names,
    /// duplicate artifacts, unknown dependencies, or dependency cycles
    pub fn build(components: impl IntoIterator<Item = Component>) -> Result<Self, GraphError> {
        let mut by_name = BTreeMap::new();
        for component in components {
            if !valid_name(&component.name) {
                return Err(GraphError::InvalidName(component.name.clone()));
            }

            let mut seen = HashSet::new();
            for artifact in &component.artifacts {
                if !seen.insert(artifact.name.as_str()) {
                    return Err(GraphError::DuplicateArtifact {
                        component: component.name.clone(),
                        artifact: artifact.name.clone(),
                    });
                }
            }

            let name = component.name.clone();
            if by_name.insert(name.clone(), Arc::new(component)).is_some() {
                return Err(GraphError::DuplicateComponent(name));
            }
        }

        for component in by_name.values() {
            for dependency in &component.depends_on {
                if !by_name.contains_key(dependency) {
                    return Err(GraphError::UnknownDependency {
                        component: component.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let order = component_order(&by_name)?;

        let mut steps = Vec::new();
        for name in &order {
            let Some(component) = by_name.get(name) else {
                continue;
            };

            let mut upstream: Vec<StepId> =
                component.depends_on.iter().map(StepId::install).collect();
            upstream.sort();
            upstream.dedup();

            let prepare = StepId::prepare(name);
            steps.push(StepNode {
                id: prepare.clone(),
                predecessors: upstream,
            });

            let mut copies = Vec::with_capacity(component.artifacts.len());
            for artifact in &component.artifacts {
                let copy = StepId::copy(name, &artifact.name);
                steps.push(StepNode {
                    id: copy.clone(),
                    predecessors: vec![prepare.clone()],
                });
                copies.push(copy);
            }

            let install_predecessors = if copies.is_empty() {
                vec![prepare]
            } else {
                copies
            };
            steps.push(StepNode {
                id: StepId::install(name),
                predecessors: install_predecessors,
            });
        }

        let index = steps
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        Ok(Self {
            components: by_name,
            order,
            steps,
            index,
        })
    }

    /// All steps, every step after its predecessors
    #[must_use]
    pub fn steps(&self) -> &[StepNode] {
        &self.steps
    }

    /// Look up a step
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&StepNode> {
        self.index.get(id).and_then(|i| self.steps.get(*i))
    }

    /// Steps that directly wait on `id`
    #[must_use]
    pub fn dependents(&self, id: &StepId) -> Vec<&StepId> {
        self.steps
            .iter()
            .filter(|node| node.predecessors.contains(id))
            .map(|node| &node.id)
            .collect()
    }

    /// Look up a component
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&Arc<Component>> {
        self.components.get(name)
    }

    /// Component names in dependency order
    #[must_use]
    pub fn component_order(&self) -> &[String] {
        &self.order
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Kahn's algorithm over component dependencies
fn component_order(
    components: &BTreeMap<String, Arc<Component>>,
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> =
        components.keys().map(|name| (name.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for component in components.values() {
        let mut deps: Vec<&str> = component.depends_on.iter().map(String::as_str).collect();
        deps.sort_unstable();
        deps.dedup();
        for dep in deps {
            *in_degree.entry(component.name.as_str()).or_default() += 1;
            dependents
                .entry(dep)
                .or_default()
                .push(component.name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(components.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if order.len() != components.len() {
        return Err(GraphError::Cycle {
            path: find_cycle(components, &order),
        });
    }

    Ok(order)
}

/// Walk `depends_on` edges among unordered components until one repeats
fn find_cycle(components: &BTreeMap<String, Arc<Component>>, ordered: &[String]) -> Vec<String> {
    let done: HashSet<&str> = ordered.iter().map(String::as_str).collect();
    let Some(start) = components.keys().find(|name| !done.contains(name.as_str())) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start.as_str()];
    let mut current = start.as_str();
    loop {
        let next = components.get(current).and_then(|component| {
            component
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| !done.contains(dep))
                .min()
        });
        let Some(next) = next else {
            break;
        };

        if let Some(pos) = path.iter().position(|seen| *seen == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.into_iter().map(String::from).collect()
}

/// Component names end up in step keys and staging paths
fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
