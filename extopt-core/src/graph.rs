//! Dependency graph construction over `ExternalRun` pipelines.
//!
//! Each unique `ExternalRun` (by `Rc` identity) becomes one node; within a
//! pipeline, step *i* depends on step *i-1*. Identical steps shared across
//! functions collapse to a single node, so a step used by several
//! functions executes once per evaluation — `spec.md` §4.4, §8 invariant 2.

use std::collections::HashMap;
use std::rc::Rc;

use petgraph::graphmap::DiGraphMap;

use crate::run::RunHandle;

/// Stable identity for a run node: the address of its `Rc<RefCell<..>>`
/// allocation. Two clones of the same handle produce the same id.
pub type RunId = usize;

pub fn run_id(run: &RunHandle) -> RunId {
    Rc::as_ptr(run) as usize
}

/// Map from every unique run to the runs that must complete before it.
pub struct EvalGraph {
    pub graph: DiGraphMap<RunId, ()>,
    pub handles: HashMap<RunId, RunHandle>,
}

impl EvalGraph {
    pub fn build(pipelines: &[Vec<RunHandle>]) -> Self {
        let mut graph = DiGraphMap::new();
        let mut handles = HashMap::new();

        for pipeline in pipelines {
            for run in pipeline {
                let id = run_id(run);
                graph.add_node(id);
                handles.entry(id).or_insert_with(|| run.clone());
            }
            for window in pipeline.windows(2) {
                let prev = run_id(&window[0]);
                let next = run_id(&window[1]);
                graph.add_edge(prev, next, ());
            }
        }

        Self { graph, handles }
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct predecessors of `node` (runs that must finish before it).
    pub fn predecessors(&self, node: RunId) -> Vec<RunId> {
        self.graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .collect()
    }

    pub fn nodes(&self) -> Vec<RunId> {
        self.graph.nodes().collect()
    }
}
