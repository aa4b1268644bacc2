// src/dag/readiness.rs

//! Edge evaluation for a single target node.

use std::collections::BTreeMap;

use crate::dag::graph::PipelineGraph;
use crate::dag::state::TaskState;
use crate::types::EdgeCondition;

/// Whether a PENDING node can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one source is still live and none is dead.
    Waiting,
    /// Every source satisfied one of its edges into this node.
    Ready,
    /// Some source ended in a state none of its edges accepts.
    Dead,
}

/// Evaluate the incoming edges of `node`.
///
/// Edges are grouped by source. Within a group the edges are alternatives
/// (`a -> b on success` plus `a -> b on failure` fires on either outcome);
/// across groups the join is conjunctive. A dead group makes the node dead
/// even while other sources are still running.
pub fn readiness<F>(graph: &PipelineGraph, node: &str, state_of: F) -> Readiness
where
    F: Fn(&str) -> Option<TaskState>,
{
    let mut groups: BTreeMap<&str, Vec<EdgeCondition>> = BTreeMap::new();
    for edge in graph.incoming(node) {
        groups.entry(edge.from.as_str()).or_default().push(edge.on);
    }

    let mut waiting = false;

    for (source, conditions) in groups {
        let Some(state) = state_of(source) else {
            // Unknown source: treat as unsatisfiable rather than hang.
            return Readiness::Dead;
        };

        if !state.is_terminal() {
            waiting = true;
            continue;
        }

        if !conditions.iter().any(|c| c.matches(state)) {
            return Readiness::Dead;
        }
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// A FAILURE/ERROR node is handled when it has dependents and every one of
/// them is reached by an edge accepting that outcome.
///
/// Dependents are grouped by target, matching the alternative-edge rule in
/// [`readiness`]: `a -> b on success` plus `a -> b on failure` still counts
/// as handled. A dependent reached only through `success` edges was on a
/// required path, so the failure is not handled.
pub fn failure_handled(graph: &PipelineGraph, node: &str, state: TaskState) -> bool {
    if !state.is_failed() {
        return false;
    }

    let mut targets: BTreeMap<&str, bool> = BTreeMap::new();
    for edge in graph.outgoing(node) {
        *targets.entry(edge.to.as_str()).or_default() |= edge.on.matches(state);
    }

    !targets.is_empty() && targets.values().all(|&accepted| accepted)
}
