// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{PipeflowError, Result};
use crate::template::PipelineDefinition;
use crate::types::{EdgeCondition, NodeId};

/// A resolved edge of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub on: EdgeCondition,
}

/// Internal node structure: indices into `PipelineGraph::edges`.
#[derive(Debug, Clone, Default)]
struct GraphNode {
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

/// Immutable adjacency view of one pipeline definition.
///
/// Construction validates the shape of the template (unique node ids, edges
/// between known nodes, no self edges, no cycles); the rest of the engine
/// can assume a well-formed DAG.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// Node ids in declaration order.
    order: Vec<NodeId>,
    nodes: HashMap<NodeId, GraphNode>,
    edges: Vec<Edge>,
}

impl PipelineGraph {
    pub fn from_definition(def: &PipelineDefinition) -> Result<Self> {
        if def.nodes.is_empty() {
            return Err(PipeflowError::Validation(format!(
                "pipeline '{}' has no nodes",
                def.id
            )));
        }

        let mut order = Vec::with_capacity(def.nodes.len());
        let mut nodes: HashMap<NodeId, GraphNode> = HashMap::new();

        for node in &def.nodes {
            if nodes.insert(node.id.clone(), GraphNode::default()).is_some() {
                return Err(PipeflowError::Validation(format!(
                    "pipeline '{}' declares node '{}' more than once",
                    def.id, node.id
                )));
            }
            order.push(node.id.clone());
        }

        let mut edges = Vec::with_capacity(def.edges.len());
        let mut seen: HashSet<(&str, &str, EdgeCondition)> = HashSet::new();

        for edge in &def.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end) {
                    return Err(PipeflowError::Validation(format!(
                        "pipeline '{}' has an edge referencing unknown node '{}'",
                        def.id, end
                    )));
                }
            }
            if edge.from == edge.to {
                return Err(PipeflowError::Validation(format!(
                    "pipeline '{}': node '{}' cannot depend on itself",
                    def.id, edge.from
                )));
            }
            // Identical duplicates carry no extra meaning.
            if !seen.insert((edge.from.as_str(), edge.to.as_str(), edge.on)) {
                continue;
            }

            let idx = edges.len();
            edges.push(Edge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                on: edge.on,
            });
            if let Some(n) = nodes.get_mut(&edge.from) {
                n.outgoing.push(idx);
            }
            if let Some(n) = nodes.get_mut(&edge.to) {
                n.incoming.push(idx);
            }
        }

        let graph = Self {
            order,
            nodes,
            edges,
        };
        graph.ensure_acyclic(&def.id)?;
        Ok(graph)
    }

    fn ensure_acyclic(&self, pipeline: &str) -> Result<()> {
        // Edge direction follows execution: from -> to.
        let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in &self.order {
            g.add_node(name.as_str());
        }
        for edge in &self.edges {
            g.add_edge(edge.from.as_str(), edge.to.as_str(), ());
        }

        match toposort(&g, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => Err(PipeflowError::DagCycle(format!(
                "cycle detected in pipeline '{}' involving node '{}'",
                pipeline,
                cycle.node_id()
            ))),
        }
    }

    /// Node ids in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Nodes without incoming edges, in declaration order.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.nodes()
            .filter(|n| self.incoming(n).next().is_none())
            .collect()
    }

    pub fn incoming(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.nodes
            .get(node)
            .map(|n| n.incoming.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.edges[i])
    }

    pub fn outgoing(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.nodes
            .get(node)
            .map(|n| n.outgoing.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.edges[i])
    }

    /// Distinct direct successors of `node`, in edge order.
    pub fn successors(&self, node: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.outgoing(node)
            .map(|e| e.to.as_str())
            .filter(|to| seen.insert(*to))
            .collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{EdgeDefinition, NodeDefinition};

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            task: id.to_string(),
            position: None,
            params: Default::default(),
        }
    }

    fn edge(from: &str, to: &str, on: EdgeCondition) -> EdgeDefinition {
        EdgeDefinition {
            from: from.to_string(),
            to: to.to_string(),
            on,
        }
    }

    fn pipeline(nodes: &[&str], edges: Vec<EdgeDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            id: "p".to_string(),
            category: None,
            nodes: nodes.iter().map(|n| node(n)).collect(),
            edges,
        }
    }

    #[test]
    fn entry_nodes_have_no_incoming_edges() {
        let def = pipeline(
            &["a", "b", "c", "d"],
            vec![
                edge("a", "c", EdgeCondition::Success),
                edge("b", "c", EdgeCondition::Success),
                edge("c", "d", EdgeCondition::Failure),
            ],
        );
        let g = PipelineGraph::from_definition(&def).unwrap();
        assert_eq!(g.entry_nodes(), vec!["a", "b"]);
        assert_eq!(g.successors("c"), vec!["d"]);
        assert_eq!(g.incoming("c").count(), 2);
    }

    #[test]
    fn rejects_cycles() {
        let def = pipeline(
            &["a", "b", "c"],
            vec![
                edge("a", "b", EdgeCondition::Success),
                edge("b", "c", EdgeCondition::Success),
                edge("c", "b", EdgeCondition::Failure),
            ],
        );
        let err = PipelineGraph::from_definition(&def).unwrap_err();
        assert!(matches!(err, PipeflowError::DagCycle(_)));
    }

    #[test]
    fn rejects_unknown_nodes_and_duplicates() {
        let def = pipeline(&["a"], vec![edge("a", "z", EdgeCondition::Success)]);
        assert!(matches!(
            PipelineGraph::from_definition(&def),
            Err(PipeflowError::Validation(_))
        ));

        let def = pipeline(&["a", "a"], vec![]);
        assert!(matches!(
            PipelineGraph::from_definition(&def),
            Err(PipeflowError::Validation(_))
        ));

        let def = pipeline(&[], vec![]);
        assert!(matches!(
            PipelineGraph::from_definition(&def),
            Err(PipeflowError::Validation(_))
        ));
    }

    #[test]
    fn parallel_edges_from_one_source_are_kept() {
        let def = pipeline(
            &["a", "b"],
            vec![
                edge("a", "b", EdgeCondition::Success),
                edge("a", "b", EdgeCondition::Failure),
                edge("a", "b", EdgeCondition::Success),
            ],
        );
        let g = PipelineGraph::from_definition(&def).unwrap();
        assert_eq!(g.incoming("b").count(), 2);
        assert_eq!(g.successors("a"), vec!["b"]);
    }
}
