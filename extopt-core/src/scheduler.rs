//! The parallel poll-based scheduler — `spec.md` §4.4.
//!
//! ```text
//! loop:
//!   allRun = true
//!   for each (node, prereqs) in graph:
//!     if not active[node]: continue
//!     if node.isIni() or node.isRun():
//!        node.poll(); allRun &= node.isRun(); continue
//!     allRun &= false
//!     if every prereq.isRun(): node.initialize(); node.poll()
//!   if allRun: exit
//!   sleep(waitTime)
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info_span};

use crate::error::EngineResult;
use crate::graph::{EvalGraph, RunId};

/// Run the scheduler over `graph`, starting with `active` marked true for
/// every node the caller wants evaluated. Dependency-closure expansion
/// (marking a node's prerequisites active too) happens inline, every pass,
/// before polling — this is what lets a gradient evaluation pull in only
/// the branches of the graph that feed an active constraint.
pub fn run_graph(
    graph: &EvalGraph,
    mut active: HashMap<RunId, bool>,
    wait_time: Duration,
) -> EngineResult<()> {
    if graph.is_empty() {
        return Ok(());
    }
    let span = info_span!("scheduler_pass", nodes = graph.graph.node_count());
    let _guard = span.enter();

    loop {
        let mut all_run = true;
        let nodes = graph.nodes();

        for node in &nodes {
            if !*active.get(node).unwrap_or(&false) {
                continue;
            }

            for prereq in graph.predecessors(*node) {
                active.insert(prereq, true);
            }

            let handle = &graph.handles[node];
            let (is_ini, is_run) = {
                let r = handle.borrow();
                (r.is_initialized(), r.is_run())
            };

            if is_ini || is_run {
                let done = handle.borrow_mut().poll()?;
                all_run &= done.is_some() || is_run;
                continue;
            }

            let prereqs = graph.predecessors(*node);
            let prereqs_done: HashSet<RunId> = prereqs
                .iter()
                .copied()
                .filter(|p| graph.handles[p].borrow().is_run())
                .collect();

            all_run = false;
            if prereqs_done.len() == prereqs.len() {
                let mut r = handle.borrow_mut();
                r.initialize()?;
                r.poll()?;
            }
        }

        if all_run {
            debug!("scheduler pass complete, all active nodes run");
            return Ok(());
        }
        std::thread::sleep(wait_time);
    }
}
