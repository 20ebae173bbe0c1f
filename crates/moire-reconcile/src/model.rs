//! Row types for one snapshot: nodes, edges, processes, timeline events.

use serde::Serialize;
use serde_json::Value;

use crate::attrs::AttrBag;

/// Kind tag carried by synthesized placeholder nodes.
pub const GHOST_KIND: &str = "ghost";

/// A typed entity in the captured concurrency graph.
///
/// `kind` is an open tag (`mutex`, `request`, `connection`, ...); unknown
/// kinds are valid and render through the generic handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub kind: String,
    pub process: String,
    pub proc_key: String,
    pub attrs: AttrBag,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            process: String::new(),
            proc_key: String::new(),
            attrs: AttrBag::empty(),
        }
    }

    pub fn in_process(mut self, process: impl Into<String>, proc_key: impl Into<String>) -> Self {
        self.process = process.into();
        self.proc_key = proc_key.into();
        self
    }

    pub fn with_attrs(mut self, attrs: Value) -> Self {
        self.attrs = AttrBag::from_value(attrs);
        self
    }

    pub fn is_ghost(&self) -> bool {
        self.kind == GHOST_KIND
    }
}

/// A typed relation between two node ids. Either endpoint may be absent
/// from the snapshot's node set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub src_id: String,
    pub dst_id: String,
    pub kind: String,
    pub attrs: AttrBag,
}

impl Edge {
    pub fn new(
        src_id: impl Into<String>,
        dst_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            kind: kind.into(),
            attrs: AttrBag::empty(),
        }
    }
}

/// Per-process metadata recorded alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub process: String,
    pub pid: Option<i64>,
    pub proc_key: String,
    pub status: String,
    pub command: Option<String>,
    pub args_preview: Option<String>,
}

/// One timestamped event row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub id: String,
    pub ts_ns: i64,
    pub proc_key: String,
    pub entity_id: String,
    pub parent_entity_id: Option<String>,
    pub name: String,
    pub attrs: AttrBag,
}

/// An in-flight request whose elapsed time crossed the caller's threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckRequest {
    pub node: Node,
    pub elapsed_ns: Option<i64>,
    pub method: Option<String>,
}
