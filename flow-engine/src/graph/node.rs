// Task graph nodes
// One node per concrete task instantiation; edges are immutable once built

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::defs::{CachePolicy, CheckSpec, ConsumeSpec, DataItem, Marker, Passthrough, Pattern};
use crate::error::{GraphError, Warning};
use crate::runner::ImplHandle;
use crate::value::Value;

pub type NodeId = usize;

/// Leaf nodes execute an implementation and consume a concurrency slot;
/// aggregation nodes represent compound-task completion and do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Aggregation,
}

/// Node lifecycle during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    /// A predecessor failed; this node never runs
    Blocked,
}

/// One concrete, instantiated occurrence of a task in the built graph
pub struct TaskNode {
    pub id: NodeId,
    /// Unique instantiation name, e.g. `hdl.compile` or `hdl.sweep[w=8]`
    pub name: String,
    /// Name of the originating elaborated task, the cache key prefix
    pub task_name: String,
    pub package: String,
    pub kind: NodeKind,
    pub params: BTreeMap<String, Value>,
    pub deferred_params: Vec<String>,
    pub consumes: ConsumeSpec,
    pub produces: Vec<Pattern>,
    pub passthrough: Passthrough,
    pub cache: Option<CachePolicy>,
    pub check: Option<CheckSpec>,
    pub implementation: Option<ImplHandle>,
    pub run_dir: PathBuf,
    /// Matrix variables and other scope-local bindings
    pub synthetic: BTreeMap<String, Value>,

    // Mutable only by the scheduler, never after completion
    pub status: NodeStatus,
    pub changed: bool,
    pub skipped: bool,
    pub outputs: Vec<DataItem>,
    pub markers: Vec<Marker>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl TaskNode {
    pub fn caching_enabled(&self) -> bool {
        self.cache.as_ref().map(|c| c.enabled).unwrap_or(false)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// The built task graph: nodes plus forward and reverse adjacency.
/// Edges never change after construction; node state does.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    successors: Vec<Vec<NodeId>>,
    predecessors: Vec<Vec<NodeId>>,
    name_indices: HashMap<String, NodeId>,
    warnings: Vec<Warning>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, mut node: TaskNode) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.name_indices.insert(node.name.clone(), id);
        self.nodes.push(node);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
        id
    }

    /// Add a dependency edge `from -> to` (`to` waits for `from`)
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if from == to {
            return;
        }
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    pub fn node(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TaskNode {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.name_indices.get(name).copied()
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.successors[id]
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.predecessors[id]
    }

    pub fn add_warning(&mut self, warning: Warning) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Depth-first cycle check with a recursion marker. A cycle is fatal
    /// before any node runs.
    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut visited = vec![false; self.nodes.len()];
        let mut in_stack = vec![false; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if !visited[start] {
                self.dfs_cycle(start, &mut visited, &mut in_stack)?;
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        id: NodeId,
        visited: &mut [bool],
        in_stack: &mut [bool],
    ) -> Result<(), GraphError> {
        visited[id] = true;
        in_stack[id] = true;

        for &next in &self.successors[id] {
            if in_stack[next] {
                return Err(GraphError::cyclic(format!(
                    "dependency cycle through '{}' and '{}'",
                    self.nodes[id].name, self.nodes[next].name
                )));
            }
            if !visited[next] {
                self.dfs_cycle(next, visited, in_stack)?;
            }
        }

        in_stack[id] = false;
        Ok(())
    }

    /// Nodes with no predecessors
    pub fn sources(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.predecessors[id].is_empty())
            .collect()
    }
}
