//! Stage dependency graph

use crate::definition::WorkflowDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DagValidationError {
    #[error("Cycle detected in workflow: {0}")]
    CycleDetected(String),

    #[error("Missing dependency: stage {stage} depends on {dependency} which does not exist")]
    MissingDependency { stage: String, dependency: String },

    #[error("Empty workflow: no stages defined")]
    EmptyWorkflow,
}

/// Directed acyclic graph of stages; edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct StageDag {
    graph: DiGraph<String, ()>,
    stage_to_node: HashMap<String, NodeIndex>,
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl StageDag {
    /// Build and validate the graph of a definition
    pub fn new(definition: &WorkflowDefinition) -> Result<Self, DagValidationError> {
        Self::from_dependencies(
            definition
                .stages
                .iter()
                .map(|(name, stage)| (name.clone(), stage.depends_on.clone())),
        )
    }

    /// Build and validate a graph from `(stage, dependencies)` pairs
    pub fn from_dependencies<I>(stages: I) -> Result<Self, DagValidationError>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let stages: Vec<(String, Vec<String>)> = stages.into_iter().collect();
        if stages.is_empty() {
            return Err(DagValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut stage_to_node = HashMap::new();
        let mut dependencies = HashMap::new();

        for (name, deps) in &stages {
            let node = graph.add_node(name.clone());
            stage_to_node.insert(name.clone(), node);
            dependencies.insert(name.clone(), deps.iter().cloned().collect::<BTreeSet<_>>());
        }

        for (name, _) in &stages {
            let to_node = stage_to_node[name];

            for dep in &dependencies[name] {
                let from_node = stage_to_node.get(dep).ok_or_else(|| {
                    DagValidationError::MissingDependency {
                        stage: name.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                graph.add_edge(*from_node, to_node, ());
            }
        }

        let dag = Self {
            graph,
            stage_to_node,
            dependencies,
        };

        dag.validate()?;

        Ok(dag)
    }

    /// Reject cycles with a depth-first walk
    pub fn validate(&self) -> Result<(), DagValidationError> {
        match self.find_cycle() {
            Some(cycle) => Err(DagValidationError::CycleDetected(cycle)),
            None => Ok(()),
        }
    }

    fn find_cycle(&self) -> Option<String> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in self.graph.node_indices() {
            if let Some(mut cycle) = self.find_cycle_util(node, &mut visited, &mut rec_stack) {
                cycle.reverse();
                return Some(
                    cycle
                        .iter()
                        .map(|n| self.graph[*n].clone())
                        .collect::<Vec<_>>()
                        .join(" -> "),
                );
            }
        }

        None
    }

    fn find_cycle_util(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        rec_stack: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        if rec_stack.contains(&node) {
            return Some(vec![node]);
        }

        if visited.contains(&node) {
            return None;
        }

        visited.insert(node);
        rec_stack.insert(node);

        for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(mut cycle) = self.find_cycle_util(neighbor, visited, rec_stack) {
                cycle.push(node);
                return Some(cycle);
            }
        }

        rec_stack.remove(&node);
        None
    }

    /// Stages without dependencies, sorted by name
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        roots.sort();
        roots
    }

    pub fn dependencies(&self, stage: &str) -> Vec<String> {
        self.dependencies
            .get(stage)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stages that directly depend on `stage`, sorted by name
    pub fn dependents(&self, stage: &str) -> Vec<String> {
        let Some(node) = self.stage_to_node.get(stage) else {
            return Vec::new();
        };

        let mut dependents: Vec<String> = self
            .graph
            .neighbors_directed(*node, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// True once every dependency of `stage` is in `completed`
    pub fn is_ready(&self, stage: &str, completed: &BTreeSet<String>) -> bool {
        self.dependencies
            .get(stage)
            .map_or(false, |deps| deps.iter().all(|dep| completed.contains(dep)))
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stage_to_node.contains_key(stage)
    }

    pub fn len(&self) -> usize {
        self.stage_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage_to_node.is_empty()
    }
}
