//! Per-kind node summaries.
//!
//! Dispatch on the open `kind` tag goes through [`KindRegistry`]; kinds
//! without a registered handler use the registry's fallback, so adding a
//! kind never touches callers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::attrs::{self, keys};
use crate::duplex::{self, Health, HealthThresholds};
use crate::graph::Graph;
use crate::model::Node;
use crate::palette::ProcessPalette;

const SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub label: String,
    pub kind_label: String,
    pub severity: Health,
}

/// Capture-time inputs shared by every handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryContext {
    pub captured_at_ns: Option<i64>,
    pub thresholds: HealthThresholds,
}

pub trait KindHandler: Send + Sync {
    fn summarize(&self, node: &Node, cx: &SummaryContext) -> NodeSummary;
}

/// Renders any kind: the best label alias, the raw kind, healthy.
#[derive(Debug, Clone, Default)]
pub struct GenericHandler {
    kind_label: Option<String>,
}

impl GenericHandler {
    pub fn labeled(kind_label: impl Into<String>) -> Self {
        Self {
            kind_label: Some(kind_label.into()),
        }
    }
}

impl KindHandler for GenericHandler {
    fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
        NodeSummary {
            label: label_or_id(node, keys::LABEL),
            kind_label: self.kind_label.clone().unwrap_or_else(|| node.kind.clone()),
            severity: Health::Healthy,
        }
    }
}

struct LockHandler;

impl KindHandler for LockHandler {
    fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
        let waiters = node.attrs.count(keys::WAITERS).unwrap_or(0);
        let held = node.attrs.count(keys::HOLDERS).unwrap_or(0) > 0;
        let severity = match (waiters, held) {
            (0, _) => Health::Healthy,
            (_, true) => Health::Warning,
            // Waiters but no holder: nobody is going to release it.
            (_, false) => Health::Critical,
        };
        NodeSummary {
            label: label_or_id(node, keys::LABEL),
            kind_label: "lock".to_string(),
            severity,
        }
    }
}

struct SemaphoreHandler;

impl KindHandler for SemaphoreHandler {
    fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
        let waiters = node.attrs.count(keys::WAITERS).unwrap_or(0);
        NodeSummary {
            label: label_or_id(node, keys::LABEL),
            kind_label: "semaphore".to_string(),
            severity: if waiters > 0 {
                Health::Warning
            } else {
                Health::Healthy
            },
        }
    }
}

struct ChannelHandler;

impl KindHandler for ChannelHandler {
    fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
        let queued = node.attrs.count(keys::QUEUE_LEN);
        let capacity = node.attrs.count(keys::CAPACITY);
        let severity = match (queued, capacity) {
            (Some(q), Some(c)) if c > 0 && q >= c => Health::Warning,
            _ => Health::Healthy,
        };
        NodeSummary {
            label: label_or_id(node, keys::LABEL),
            kind_label: "channel".to_string(),
            severity,
        }
    }
}

struct RpcHandler {
    kind_label: &'static str,
}

impl KindHandler for RpcHandler {
    fn summarize(&self, node: &Node, cx: &SummaryContext) -> NodeSummary {
        let elapsed = node.attrs.age_ns(&attrs::ELAPSED, cx.captured_at_ns);
        let severity = match elapsed {
            Some(ns) if ns >= 30 * SEC => Health::Critical,
            Some(ns) if ns >= 5 * SEC => Health::Warning,
            _ => Health::Healthy,
        };
        NodeSummary {
            label: label_or_id(node, keys::METHOD),
            kind_label: self.kind_label.to_string(),
            severity,
        }
    }
}

struct ConnectionHandler;

impl KindHandler for ConnectionHandler {
    fn summarize(&self, node: &Node, cx: &SummaryContext) -> NodeSummary {
        let severity = cx.thresholds.classify(
            node.attrs.count(keys::PENDING_REQUESTS),
            node.attrs.count(keys::PENDING_RESPONSES),
            node.attrs.age_ns(&attrs::LAST_RECV_AGE, cx.captured_at_ns),
        );
        NodeSummary {
            label: duplex::connection_label(&node.attrs, &node.id),
            kind_label: "connection".to_string(),
            severity,
        }
    }
}

struct GhostHandler;

impl KindHandler for GhostHandler {
    fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
        NodeSummary {
            label: node.id.clone(),
            kind_label: "missing".to_string(),
            severity: Health::Warning,
        }
    }
}

fn label_or_id(node: &Node, aliases: &[&str]) -> String {
    node.attrs
        .string(aliases)
        .or_else(|| node.attrs.string(keys::LABEL))
        .unwrap_or_else(|| node.id.clone())
}

pub struct KindRegistry {
    handlers: HashMap<String, Arc<dyn KindHandler>>,
    fallback: Arc<dyn KindHandler>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        let mut registry = Self::with_fallback(GenericHandler::default());
        registry.register(["mutex", "rwlock", "lock"], LockHandler);
        registry.register(["semaphore"], SemaphoreHandler);
        registry.register(["mpsc", "channel", "oneshot"], ChannelHandler);
        registry.register(["request"], RpcHandler { kind_label: "request" });
        registry.register(["response"], RpcHandler { kind_label: "response" });
        registry.register([duplex::CONNECTION_KIND], ConnectionHandler);
        registry.register(["future"], GenericHandler::labeled("future"));
        registry.register(["task"], GenericHandler::labeled("task"));
        registry.register([crate::model::GHOST_KIND], GhostHandler);
        registry
    }
}

impl KindRegistry {
    /// An empty registry; every kind goes to `fallback`.
    pub fn with_fallback(fallback: impl KindHandler + 'static) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(fallback),
        }
    }

    pub fn register<'k>(
        &mut self,
        kinds: impl IntoIterator<Item = &'k str>,
        handler: impl KindHandler + 'static,
    ) {
        let handler: Arc<dyn KindHandler> = Arc::new(handler);
        for kind in kinds {
            self.handlers.insert(kind.to_string(), Arc::clone(&handler));
        }
    }

    pub fn handler(&self, kind: &str) -> &dyn KindHandler {
        self.handlers
            .get(kind)
            .map(|handler| handler.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    pub fn summarize(&self, node: &Node, cx: &SummaryContext) -> NodeSummary {
        self.handler(&node.kind).summarize(node, cx)
    }
}

/// A node ready for a renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: String,
    pub kind: String,
    pub process: String,
    pub proc_key: String,
    pub ghost: bool,
    pub color: String,
    #[serde(flatten)]
    pub summary: NodeSummary,
}

pub fn describe_graph(
    graph: &Graph,
    registry: &KindRegistry,
    palette: &mut ProcessPalette,
    cx: &SummaryContext,
) -> Vec<NodeView> {
    graph
        .nodes
        .iter()
        .map(|node| NodeView {
            id: node.id.clone(),
            kind: node.kind.clone(),
            process: node.process.clone(),
            proc_key: node.proc_key.clone(),
            ghost: node.is_ghost(),
            color: palette.color_for(&node.process).to_string(),
            summary: registry.summarize(node, cx),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::model::Edge;
    use serde_json::json;

    fn summarize(node: Node) -> NodeSummary {
        KindRegistry::default().summarize(&node, &SummaryContext::default())
    }

    #[test]
    fn unknown_kinds_use_the_fallback() {
        let summary = summarize(Node::new("w1", "watch").with_attrs(json!({"name": "config"})));
        assert_eq!(summary.label, "config");
        assert_eq!(summary.kind_label, "watch");
        assert_eq!(summary.severity, Health::Healthy);
    }

    #[test]
    fn adding_a_kind_needs_only_registration() {
        struct Always;
        impl KindHandler for Always {
            fn summarize(&self, node: &Node, _cx: &SummaryContext) -> NodeSummary {
                NodeSummary {
                    label: node.id.to_uppercase(),
                    kind_label: "custom".into(),
                    severity: Health::Critical,
                }
            }
        }
        let mut registry = KindRegistry::default();
        registry.register(["watch"], Always);
        let summary = registry.summarize(&Node::new("w1", "watch"), &SummaryContext::default());
        assert_eq!(summary.label, "W1");
        assert_eq!(summary.severity, Health::Critical);
    }

    #[test]
    fn contended_lock_without_holder_is_critical() {
        let held =
            summarize(Node::new("m", "mutex").with_attrs(json!({"waiters": 2, "holders": 1})));
        assert_eq!(held.severity, Health::Warning);
        let orphaned = summarize(Node::new("m", "rwlock").with_attrs(json!({"waiters": 2})));
        assert_eq!(orphaned.severity, Health::Critical);
    }

    #[test]
    fn requests_escalate_with_elapsed_time() {
        let slow = summarize(
            Node::new("r", "request").with_attrs(json!({"method": "get_blob", "elapsed_ms": 7000})),
        );
        assert_eq!(slow.label, "get_blob");
        assert_eq!(slow.severity, Health::Warning);
        let stuck = summarize(Node::new("r", "request").with_attrs(json!({"elapsed_secs": 45})));
        assert_eq!(stuck.label, "r");
        assert_eq!(stuck.severity, Health::Critical);
    }

    #[test]
    fn full_channel_warns() {
        let full =
            summarize(Node::new("c", "mpsc").with_attrs(json!({"queue_len": 8, "capacity": 8})));
        assert_eq!(full.severity, Health::Warning);
    }

    #[test]
    fn describe_graph_covers_ghosts() {
        let graph = build_graph(
            vec![Node::new("a", "mutex").in_process("app", "app-1")],
            vec![Edge::new("a", "gone", "needs")],
        );
        let mut palette = ProcessPalette::default();
        let views = describe_graph(
            &graph,
            &KindRegistry::default(),
            &mut palette,
            &SummaryContext::default(),
        );
        assert_eq!(views.len(), 2);
        assert!(views[1].ghost);
        assert_eq!(views[1].summary.kind_label, "missing");
        assert_eq!(views[1].color, views[0].color);
    }
}
