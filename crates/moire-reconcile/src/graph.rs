//! Snapshot graph assembly with ghost placeholders for dangling edges.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::attrs::AttrBag;
use crate::model::{Edge, GHOST_KIND, Node};

/// Which endpoint of an edge was absent from the node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSide {
    Src,
    Dst,
}

impl MissingSide {
    pub fn as_str(self) -> &'static str {
        match self {
            MissingSide::Src => "src",
            MissingSide::Dst => "dst",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            MissingSide::Src => "missing_src",
            MissingSide::Dst => "missing_dst",
        }
    }
}

/// Nodes (real first, then ghosts) and every input edge.
///
/// Every edge endpoint resolves to exactly one entry of `nodes`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub ghost_nodes: Vec<Node>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

/// Builds a [`Graph`] from one snapshot's node and edge rows.
///
/// Edges are kept as given. Each distinct endpoint id missing from `nodes`
/// gets exactly one ghost node, however many edges reference it.
pub fn build_graph(nodes: Vec<Node>, edges: Vec<Edge>) -> Graph {
    let mut real = Vec::with_capacity(nodes.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if index.contains_key(&node.id) {
            debug!(id = %node.id, "duplicate node row, keeping first");
            continue;
        }
        index.insert(node.id.clone(), real.len());
        real.push(node);
    }

    let mut ghost_nodes: Vec<Node> = Vec::new();
    let mut ghost_ids: HashSet<String> = HashSet::new();
    for edge in &edges {
        let sides = [
            (MissingSide::Src, &edge.src_id, &edge.dst_id),
            (MissingSide::Dst, &edge.dst_id, &edge.src_id),
        ];
        for (side, id, other) in sides {
            if index.contains_key(id.as_str()) || ghost_ids.contains(id.as_str()) {
                continue;
            }
            let anchor = index.get(other.as_str()).map(|&i| &real[i]);
            debug!(
                id = %id,
                reason = side.reason(),
                edge_kind = %edge.kind,
                "synthesizing ghost node"
            );
            ghost_ids.insert(id.clone());
            ghost_nodes.push(ghost_node(id, side, &edge.kind, anchor));
        }
    }

    if !ghost_nodes.is_empty() {
        debug!(
            nodes = real.len(),
            edges = edges.len(),
            ghosts = ghost_nodes.len(),
            "graph has dangling edges"
        );
    }

    let mut all = real;
    all.extend(ghost_nodes.iter().cloned());
    Graph {
        nodes: all,
        edges,
        ghost_nodes,
    }
}

fn ghost_node(id: &str, side: MissingSide, edge_kind: &str, anchor: Option<&Node>) -> Node {
    let attrs = AttrBag::empty()
        .with("reason", side.reason())
        .with("missing_side", side.as_str())
        .with("source", "dangling_edge")
        .with("edge_kind", edge_kind);
    let (process, proc_key) = anchor
        .map(|node| (node.process.clone(), node.proc_key.clone()))
        .unwrap_or_default();
    Node {
        id: id.to_string(),
        kind: GHOST_KIND.to_string(),
        process,
        proc_key,
        attrs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::keys;

    fn node(id: &str) -> Node {
        Node::new(id, "mutex").in_process("app", "app-1")
    }

    fn edge(src: &str, dst: &str) -> Edge {
        Edge::new(src, dst, "needs")
    }

    fn assert_every_endpoint_resolves_once(graph: &Graph) {
        for e in &graph.edges {
            for id in [&e.src_id, &e.dst_id] {
                let hits = graph.nodes.iter().filter(|n| &n.id == id).count();
                assert_eq!(hits, 1, "endpoint {id} resolved {hits} times");
            }
        }
    }

    #[test]
    fn dangling_destination_becomes_ghost() {
        let graph = build_graph(vec![node("a")], vec![edge("a", "ghost1")]);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.ghost_nodes.len(), 1);

        let ghost = graph.node("ghost1").expect("ghost present");
        assert!(ghost.is_ghost());
        assert_eq!(ghost.attrs.string(&["reason"]).as_deref(), Some("missing_dst"));
        assert_eq!(ghost.attrs.string(&["missing_side"]).as_deref(), Some("dst"));
        assert_eq!(ghost.attrs.string(&["source"]).as_deref(), Some("dangling_edge"));
        assert_eq!(ghost.process, "app");
        assert_eq!(graph.nodes[0].id, "a");
        assert_eq!(graph.nodes[1].id, "ghost1");
    }

    #[test]
    fn ghosts_are_deduplicated_per_missing_id() {
        let edges = vec![
            edge("a", "x"),
            edge("b", "x"),
            edge("x", "a"),
            edge("y", "a"),
            edge("y", "x"),
            edge("a", "z"),
        ];
        let graph = build_graph(vec![node("a"), node("b")], edges.clone());
        let mut ghost_ids: Vec<_> = graph.ghost_nodes.iter().map(|n| n.id.as_str()).collect();
        ghost_ids.sort();
        assert_eq!(ghost_ids, ["x", "y", "z"]);
        assert_eq!(graph.nodes.len(), 5);
        assert_every_endpoint_resolves_once(&graph);
    }

    #[test]
    fn first_reference_decides_ghost_reason() {
        let graph = build_graph(vec![node("a")], vec![edge("m", "a"), edge("a", "m")]);
        let ghost = graph.node("m").unwrap();
        assert_eq!(ghost.attrs.string(&["reason"]).as_deref(), Some("missing_src"));
    }

    #[test]
    fn edges_are_preserved_verbatim_including_duplicates() {
        let edges = vec![edge("a", "b"), edge("a", "b"), edge("q", "r")];
        let graph = build_graph(vec![node("a"), node("b")], edges.clone());
        assert_eq!(graph.edges, edges);
        assert_every_endpoint_resolves_once(&graph);
    }

    #[test]
    fn edge_with_both_endpoints_missing_yields_two_ghosts() {
        let graph = build_graph(vec![], vec![edge("p", "q")]);
        assert_eq!(graph.ghost_nodes.len(), 2);
        assert!(graph.ghost_nodes.iter().all(|g| g.process.is_empty()));
    }

    #[test]
    fn self_loop_on_missing_id_yields_one_ghost() {
        let graph = build_graph(vec![], vec![edge("loop", "loop")]);
        assert_eq!(graph.ghost_nodes.len(), 1);
        assert_every_endpoint_resolves_once(&graph);
    }

    #[test]
    fn duplicate_node_rows_keep_first() {
        let first = node("a").with_attrs(serde_json::json!({"label": "first"}));
        let second = node("a").with_attrs(serde_json::json!({"label": "second"}));
        let graph = build_graph(vec![first, second], vec![]);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].attrs.string(keys::LABEL).as_deref(), Some("first"));
    }
}
