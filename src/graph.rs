//! The pass dependency graph.
//!
//! Passes declare the render target names they read and write; the graph adds
//! a producer → consumer edge for every name written by one pass and read by
//! another, rejects cycles, and hands the orchestrator a topological recording
//! order. Recording strictly in this order is what guarantees that a pass
//! never reads a target before its producer has completed and transitioned it
//! to a read layout.

use std::collections::HashMap;

use anyhow::Result;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::dot::Dot;

use crate::core::error::Error;

/// One pass as the graph sees it: a name plus its declared target accesses.
#[derive(Debug, Clone)]
pub struct GraphPass {
    pub name: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

/// Dependency graph over declared render-target reads and writes.
pub struct FrameGraph {
    graph: Graph<GraphPass, String>,
    indices: Vec<NodeIndex>,
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameGraph {
    pub fn new() -> Self {
        FrameGraph {
            graph: Graph::new(),
            indices: vec![],
        }
    }

    /// Add a pass to the graph.
    ///
    /// Edges to and from already-registered passes are derived from the
    /// read/write sets.
    /// # Errors
    /// Fails with [`Error::GraphHasCycle`] if adding the pass creates a cycle.
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        reads: &[&str],
        writes: &[&str],
    ) -> Result<()> {
        let pass = GraphPass {
            name: name.into(),
            reads: reads.iter().map(|s| s.to_string()).collect(),
            writes: writes.iter().map(|s| s.to_string()).collect(),
        };
        let node = self.graph.add_node(pass);

        // For every other node: if it writes something we read, it must run
        // before us; if it reads something we write, we must run before it.
        for &other in &self.indices {
            let (other_reads, other_writes) = {
                let weight = self.graph.node_weight(other).unwrap();
                (weight.reads.clone(), weight.writes.clone())
            };
            let ours = self.graph.node_weight(node).unwrap().clone();
            for target in &ours.reads {
                if other_writes.contains(target) {
                    self.graph.add_edge(other, node, target.clone());
                }
            }
            for target in &ours.writes {
                if other_reads.contains(target) {
                    self.graph.add_edge(node, other, target.clone());
                }
            }
        }
        self.indices.push(node);

        if is_cyclic_directed(&self.graph) {
            return Err(Error::GraphHasCycle.into());
        }
        Ok(())
    }

    /// The recording order: a topological sort of the pass names.
    ///
    /// Nodes are ordered by their longest dependency chain, with insertion
    /// order as the tie break, so passes with no ordering constraint between
    /// them come out deterministically.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        // A cycle would make the layering below loop forever.
        toposort(&self.graph, None).map_err(|_| Error::GraphHasCycle)?;
        let position: HashMap<NodeIndex, usize> = self
            .indices
            .iter()
            .enumerate()
            .map(|(i, &node)| (node, i))
            .collect();
        let mut order = self.indices.clone();
        order.sort_by_key(|node| (longest_path_to(&self.graph, *node), position[node]));
        Ok(order
            .into_iter()
            .map(|node| self.graph.node_weight(node).unwrap().name.clone())
            .collect())
    }

    /// Number of passes in the graph.
    pub fn num_passes(&self) -> usize {
        self.graph.node_count()
    }

    /// The graph in `dot` format, for debugging with graphviz.
    pub fn dot(&self) -> String {
        let display = self.graph.map(|_, pass| pass.name.clone(), |_, edge| edge.clone());
        format!("{:?}", Dot::new(&display))
    }
}

fn longest_path_to(graph: &Graph<GraphPass, String>, node: NodeIndex) -> usize {
    use petgraph::Direction;
    graph
        .neighbors_directed(node, Direction::Incoming)
        .map(|parent| longest_path_to(graph, parent) + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn composition_runs_after_gbuffer() {
        let mut graph = FrameGraph::new();
        graph
            .add_pass("composition", &["albedo", "normal", "ssao_blur"], &["composition"])
            .unwrap();
        graph
            .add_pass("gbuffer", &[], &["depth", "normal", "albedo"])
            .unwrap();
        graph.add_pass("ssao", &["depth", "normal"], &["ssao"]).unwrap();
        graph.add_pass("ssao_blur", &["ssao"], &["ssao_blur"]).unwrap();

        let order = graph.execution_order().unwrap();
        assert!(index_of(&order, "gbuffer") < index_of(&order, "ssao"));
        assert!(index_of(&order, "ssao") < index_of(&order, "ssao_blur"));
        assert!(index_of(&order, "ssao_blur") < index_of(&order, "composition"));
        assert!(index_of(&order, "gbuffer") < index_of(&order, "composition"));
    }

    #[test]
    fn bloom_chain_keeps_data_order() {
        let mut graph = FrameGraph::new();
        graph.add_pass("composition", &[], &["composition"]).unwrap();
        graph
            .add_pass("bright_filter", &["composition"], &["bright_filter"])
            .unwrap();
        graph.add_pass("blur_h", &["bright_filter"], &["blur_h"]).unwrap();
        graph.add_pass("blur_v", &["blur_h"], &["blur_v"]).unwrap();
        graph
            .add_pass("bloom_combine", &["composition", "blur_v"], &["bloom"])
            .unwrap();

        let order = graph.execution_order().unwrap();
        assert_eq!(
            order,
            vec!["composition", "bright_filter", "blur_h", "blur_v", "bloom_combine"]
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let mut graph = FrameGraph::new();
        graph.add_pass("a", &["y"], &["x"]).unwrap();
        let err = graph.add_pass("b", &["x"], &["y"]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::GraphHasCycle)));
    }

    #[test]
    fn independent_passes_keep_insertion_order() {
        let mut graph = FrameGraph::new();
        graph.add_pass("gbuffer", &[], &["normal"]).unwrap();
        graph.add_pass("ssao", &["normal"], &["ssao"]).unwrap();
        graph.add_pass("ssr", &["normal"], &["ssr"]).unwrap();
        let order = graph.execution_order().unwrap();
        assert_eq!(order, vec!["gbuffer", "ssao", "ssr"]);
    }
}
