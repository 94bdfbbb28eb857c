//! Task dependency graph derived from a pipeline configuration.
//!
//! Tasks don't declare their dependencies in a dedicated schema. Instead a
//! parameter whose value is the name of another configured task denotes an
//! edge from that task (the dependency) to the task owning the parameter (the
//! dependent). The rule is applied to every string value, including strings
//! nested in arrays and tables.
//!
//! Keys starting with `upstream` (`upstream_task`, `upstream_mask`, ...) are
//! declared references: their value *must* name a configured task, otherwise
//! the configuration is malformed.
//!
//! ## Roots and leaves
//!
//! * **Roots** have no dependencies. They are the entry points of the pipeline
//!   (raw image ingestion) and are left out of the rendered graph.
//! * **Leaves** are depended upon by nobody. They are the pipeline outputs.
//!   Leaves are ordered by depth, then name, so the last leaf is the most
//!   downstream task and serves as the default selection ("run everything").

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::config::{ParamValue, PipelineConfig};
use crate::error::{CyclicConfigurationError, GraphError};

const DECLARED_PREFIX: &str = "upstream";

/// A task of the pipeline, rebuilt on every configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNode {
    pub name: String,
    /// Tasks this one depends on, sorted by name.
    pub dependencies: BTreeSet<String>,
    /// Longest distance from a root, roots have depth 0.
    pub depth: usize,
}

impl TaskNode {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            depth: 0,
        }
    }
}

/// Acyclic dependency graph with edges pointing from a dependency to its
/// dependents.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    /// Every node, sorted by (depth, name). This is a topological order.
    order: Vec<NodeIndex>,
}

/// Builds the dependency graph of a configuration.
///
/// Fails without returning a partial graph when a declared reference points
/// to a missing task or when the dependencies form a cycle.
pub fn build(config: &PipelineConfig) -> Result<TaskGraph, GraphError> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for name in config.task_names() {
        indices.insert(name, graph.add_node(TaskNode::new(name)));
    }

    let mut self_loops = BTreeSet::new();

    for (name, params) in config.tasks() {
        let mut references = References::new(config, name);
        for (key, value) in params {
            references.visit(key, value)?;
        }

        if references.self_loop {
            self_loops.insert(name.to_string());
        }

        for dependency in references.found {
            graph.add_edge(indices[dependency], indices[name], ());
        }
    }

    if !self_loops.is_empty() {
        return Err(CyclicConfigurationError {
            nodes: self_loops.into_iter().collect(),
        }
        .into());
    }

    TaskGraph::from_graph(graph)
}

/// Collects the dependencies referenced by the parameters of one task.
struct References<'a> {
    config: &'a PipelineConfig,
    task: &'a str,
    found: BTreeSet<&'a str>,
    self_loop: bool,
}

impl<'a> References<'a> {
    fn new(config: &'a PipelineConfig, task: &'a str) -> Self {
        Self {
            config,
            task,
            found: BTreeSet::new(),
            self_loop: false,
        }
    }

    fn visit(&mut self, key: &str, value: &'a ParamValue) -> Result<(), GraphError> {
        match value {
            ParamValue::String(target) => self.reference(key, target),
            ParamValue::Array(items) => {
                for item in items {
                    self.visit(key, item)?;
                }
                Ok(())
            }
            ParamValue::Table(table) => {
                for (key, value) in table {
                    self.visit(key, value)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reference(&mut self, key: &str, target: &'a str) -> Result<(), GraphError> {
        let declared = key.starts_with(DECLARED_PREFIX);

        if target == self.task {
            // Only a declared reference to itself is a dependency.
            self.self_loop |= declared;
            return Ok(());
        }

        match self.config.task_names().find(|name| *name == target) {
            Some(name) => {
                self.found.insert(name);
                Ok(())
            }
            None if declared => Err(GraphError::UnknownDependency {
                task: self.task.to_string(),
                key: key.to_string(),
                target: target.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl TaskGraph {
    /// Validates acyclicity, then fills in dependencies and depths from the
    /// edges of `graph`.
    fn from_graph(mut graph: DiGraph<TaskNode, ()>) -> Result<Self, GraphError> {
        let topo = match petgraph::algo::toposort(&graph, None) {
            Ok(topo) => topo,
            Err(_) => return Err(cycle_error(&graph).into()),
        };

        for &index in &topo {
            let dependencies: Vec<NodeIndex> = graph
                .neighbors_directed(index, Direction::Incoming)
                .collect();

            let depth = dependencies
                .iter()
                .map(|&dep| graph[dep].depth + 1)
                .max()
                .unwrap_or(0);

            let names = dependencies
                .iter()
                .map(|&dep| graph[dep].name.clone())
                .collect();

            let node = &mut graph[index];
            node.depth = depth;
            node.dependencies = names;
        }

        let mut order = topo;
        order.sort_by(|&a, &b| {
            (graph[a].depth, &graph[a].name).cmp(&(graph[b].depth, &graph[b].name))
        });

        Ok(Self { graph, order })
    }

    /// Every task, dependencies before dependents, ties broken by name.
    pub fn topological_order(&self) -> Vec<&TaskNode> {
        self.order.iter().map(|&i| &self.graph[i]).collect()
    }

    /// Names of every task, offered for selection.
    pub fn tasks(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.graph[i].name.as_str())
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.graph.node_weights().find(|node| node.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edges as `(dependency, dependent)` pairs, sorted.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<_> = self
            .graph
            .raw_edges()
            .iter()
            .map(|edge| {
                (
                    self.graph[edge.source()].name.as_str(),
                    self.graph[edge.target()].name.as_str(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    /// Tasks without dependencies, sorted by name.
    pub fn roots(&self) -> Vec<&TaskNode> {
        let mut roots: Vec<_> = self
            .graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|i| &self.graph[i])
            .collect();
        roots.sort_by(|a, b| a.name.cmp(&b.name));
        roots
    }

    /// Tasks nobody depends on, the most downstream last.
    pub fn leaves(&self) -> Vec<&TaskNode> {
        self.order
            .iter()
            .filter(|&&i| {
                self.graph
                    .neighbors_directed(i, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|&i| &self.graph[i])
            .collect()
    }

    /// The task selected by default: the last leaf.
    pub fn default_task(&self) -> Option<&str> {
        self.leaves().last().map(|node| node.name.as_str())
    }

    /// The graph shown to the user, with the roots removed. Depths and
    /// dependencies are recomputed for the remaining tasks.
    pub fn without_roots(&self) -> TaskGraph {
        let roots: BTreeSet<&str> = self.roots().iter().map(|n| n.name.as_str()).collect();

        let graph = self.graph.filter_map(
            |_, node| (!roots.contains(node.name.as_str())).then(|| TaskNode::new(&node.name)),
            |_, _| Some(()),
        );

        // A subgraph of a DAG is a DAG.
        match TaskGraph::from_graph(graph) {
            Ok(view) => view,
            Err(_) => TaskGraph {
                graph: DiGraph::new(),
                order: Vec::new(),
            },
        }
    }
}

fn cycle_error(graph: &DiGraph<TaskNode, ()>) -> CyclicConfigurationError {
    let mut nodes: Vec<String> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .flatten()
        .map(|index| graph[index].name.clone())
        .collect();
    nodes.sort();

    tracing::debug!(?nodes, "dependency cycle detected");
    CyclicConfigurationError { nodes }
}
