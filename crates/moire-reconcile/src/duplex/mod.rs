//! Duplex connection resolution.
//!
//! Each `connection` node is one side's report of a bidirectional link.
//! Legs sharing an unordered endpoint pair (and link id) are merged into a
//! [`DuplexConnection`]; a direction nobody reported gets a placeholder leg
//! so partial information stays visible.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::attrs::{self, AttrBag, keys};
use crate::model::{Node, ProcessInfo};

mod health;
mod identity;
mod pending;
mod view;

pub use health::{ConnectionState, Health, HealthThresholds};
pub use identity::{
    ConnectionIdentity, UNKNOWN_ENDPOINT, canonical_token, duplex_key, duplex_row_key,
    parse_token, resolve_identity,
};
pub use pending::{PendingIndex, PendingRefs};
pub use view::{ConnectionView, SeverityFilter, SortDirection, SortKey, apply_view};

pub const CONNECTION_KIND: &str = "connection";

/// One directional observation of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionLeg {
    /// `None` for a synthesized leg.
    pub node_id: Option<String>,
    pub token: String,
    pub direction_from: String,
    pub direction_to: String,
    pub process: String,
    pub proc_key: String,
    pub pid: Option<i64>,
    pub command: Option<String>,
    pub process_status: Option<String>,
    pub state: ConnectionState,
    pub pending_requests: Option<u64>,
    pub pending_responses: Option<u64>,
    pub pending_request_ids: Vec<String>,
    pub pending_response_ids: Vec<String>,
    pub last_recv_age_ns: Option<i64>,
    pub last_sent_age_ns: Option<i64>,
    pub health: Health,
    pub is_missing: bool,
}

/// Order-independent merge of up to two legs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplexConnection {
    pub key: String,
    pub label: String,
    pub endpoint_a: String,
    pub endpoint_b: String,
    pub link: String,
    pub legs: Vec<ConnectionLeg>,
    pub pending_requests: Option<u64>,
    pub pending_responses: Option<u64>,
    pub pending_total: u64,
    pub last_recv_age_ns: Option<i64>,
    pub last_sent_age_ns: Option<i64>,
    pub health: Health,
}

impl DuplexConnection {
    pub fn involves_process(&self, process: &str) -> bool {
        self.endpoint_a == process
            || self.endpoint_b == process
            || self
                .legs
                .iter()
                .any(|leg| leg.process == process || leg.proc_key == process)
    }
}

/// Process metadata keyed by process key, then by process name.
#[derive(Debug, Clone, Default)]
pub struct ProcessDirectory {
    by_proc_key: HashMap<String, ProcessInfo>,
    by_name: HashMap<String, ProcessInfo>,
}

impl ProcessDirectory {
    pub fn new(processes: impl IntoIterator<Item = ProcessInfo>) -> Self {
        let mut directory = Self::default();
        for info in processes {
            directory
                .by_name
                .entry(info.process.clone())
                .or_insert_with(|| info.clone());
            directory.by_proc_key.insert(info.proc_key.clone(), info);
        }
        directory
    }

    pub fn lookup(&self, proc_key: &str, process: &str) -> Option<&ProcessInfo> {
        self.by_proc_key
            .get(proc_key)
            .or_else(|| self.by_name.get(process))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DuplexOptions {
    /// Keep closed legs instead of dropping them before grouping.
    pub include_closed: bool,
}

/// Merges connection nodes into duplex rows.
#[derive(Debug, Clone)]
pub struct DuplexResolver<'a> {
    pub thresholds: HealthThresholds,
    pub processes: &'a ProcessDirectory,
    /// Capture time, used to turn absolute "last seen" timestamps into ages.
    pub captured_at_ns: Option<i64>,
    pub options: DuplexOptions,
}

struct Group {
    endpoint_a: String,
    endpoint_b: String,
    link: String,
    legs: Vec<ConnectionLeg>,
}

impl<'a> DuplexResolver<'a> {
    pub fn new(processes: &'a ProcessDirectory) -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            processes,
            captured_at_ns: None,
            options: DuplexOptions::default(),
        }
    }

    /// Resolves every `connection` node in `nodes`, building the pending
    /// index from the `request`/`response` nodes of the same slice.
    pub fn resolve(&self, nodes: &[Node]) -> Vec<DuplexConnection> {
        let pending = PendingIndex::from_nodes(nodes);
        self.resolve_with_pending(nodes, &pending)
    }

    pub fn resolve_with_pending(
        &self,
        nodes: &[Node],
        pending: &PendingIndex,
    ) -> Vec<DuplexConnection> {
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for node in nodes.iter().filter(|node| node.kind == CONNECTION_KIND) {
            let state = ConnectionState::from_attrs(&node.attrs);
            if state == ConnectionState::Closed && !self.options.include_closed {
                debug!(node_id = %node.id, "skipping closed connection");
                continue;
            }
            let identity = resolve_identity(node);
            let leg = self.observed_leg(node, &identity, state, pending);
            let (a, b) = identity.endpoints();
            let group = groups.entry(identity.row_key()).or_insert_with(|| Group {
                endpoint_a: a.to_string(),
                endpoint_b: b.to_string(),
                link: identity.link.clone(),
                legs: Vec::new(),
            });
            push_leg(&mut group.legs, leg);
        }

        groups
            .into_iter()
            .map(|(key, group)| self.finish(key, group, pending))
            .collect()
    }

    fn observed_leg(
        &self,
        node: &Node,
        identity: &ConnectionIdentity,
        state: ConnectionState,
        pending: &PendingIndex,
    ) -> ConnectionLeg {
        let refs = pending.lookup(identity);
        let pending_requests = node
            .attrs
            .count(keys::PENDING_REQUESTS)
            .or_else(|| refs.map(|r| r.request_ids.len() as u64));
        let pending_responses = node
            .attrs
            .count(keys::PENDING_RESPONSES)
            .or_else(|| refs.map(|r| r.response_ids.len() as u64));
        let last_recv_age_ns = node.attrs.age_ns(&attrs::LAST_RECV_AGE, self.captured_at_ns);
        let last_sent_age_ns = node.attrs.age_ns(&attrs::LAST_SENT_AGE, self.captured_at_ns);

        let mut health =
            self.thresholds
                .classify(pending_requests, pending_responses, last_recv_age_ns);
        if state == ConnectionState::Closed {
            health = health.max(Health::Warning);
        }

        let info = self.processes.lookup(&node.proc_key, &node.process);
        ConnectionLeg {
            node_id: Some(node.id.clone()),
            token: identity.token.clone(),
            direction_from: identity.src.clone(),
            direction_to: identity.dst.clone(),
            process: node.process.clone(),
            proc_key: node.proc_key.clone(),
            pid: info.and_then(|i| i.pid),
            command: info.and_then(|i| i.command.clone()),
            process_status: info.map(|i| i.status.clone()),
            state,
            pending_requests,
            pending_responses,
            pending_request_ids: refs.map(|r| r.request_ids.clone()).unwrap_or_default(),
            pending_response_ids: refs.map(|r| r.response_ids.clone()).unwrap_or_default(),
            last_recv_age_ns,
            last_sent_age_ns,
            health,
            is_missing: false,
        }
    }

    fn missing_leg(
        &self,
        from: &str,
        to: &str,
        link: &str,
        pending: &PendingIndex,
    ) -> ConnectionLeg {
        let identity = ConnectionIdentity {
            token: canonical_token(from, to, link),
            src: from.to_string(),
            dst: to.to_string(),
            link: link.to_string(),
            parsed: true,
        };
        let refs = pending.lookup(&identity);
        let pending_requests = refs.map(|r| r.request_ids.len() as u64);
        let pending_responses = refs.map(|r| r.response_ids.len() as u64);
        let health = self
            .thresholds
            .classify(pending_requests, pending_responses, None)
            .max(Health::Warning);
        // The reporting side is unknown; endpoints are usually process names.
        let info = self.processes.lookup(from, from);
        ConnectionLeg {
            node_id: None,
            token: identity.token,
            direction_from: identity.src,
            direction_to: identity.dst,
            process: info.map(|i| i.process.clone()).unwrap_or_else(|| from.to_string()),
            proc_key: info.map(|i| i.proc_key.clone()).unwrap_or_default(),
            pid: info.and_then(|i| i.pid),
            command: info.and_then(|i| i.command.clone()),
            process_status: info.map(|i| i.status.clone()),
            state: ConnectionState::Missing,
            pending_requests,
            pending_responses,
            pending_request_ids: refs.map(|r| r.request_ids.clone()).unwrap_or_default(),
            pending_response_ids: refs.map(|r| r.response_ids.clone()).unwrap_or_default(),
            last_recv_age_ns: None,
            last_sent_age_ns: None,
            health,
            is_missing: true,
        }
    }

    fn finish(&self, key: String, mut group: Group, pending: &PendingIndex) -> DuplexConnection {
        let (a, b) = (group.endpoint_a.clone(), group.endpoint_b.clone());
        let mut expected = vec![(a.clone(), b.clone())];
        if a != b {
            expected.push((b.clone(), a.clone()));
        }
        for (from, to) in &expected {
            let covered = group
                .legs
                .iter()
                .any(|leg| &leg.direction_from == from && &leg.direction_to == to);
            if !covered {
                debug!(%key, %from, %to, "synthesizing missing connection leg");
                let leg = self.missing_leg(from, to, &group.link, pending);
                group.legs.push(leg);
            }
        }
        group
            .legs
            .sort_by_key(|leg| (leg.direction_from != a, leg.direction_from.clone()));

        let pending_requests = sum_present(group.legs.iter().map(|leg| leg.pending_requests));
        let pending_responses = sum_present(group.legs.iter().map(|leg| leg.pending_responses));
        let health = group
            .legs
            .iter()
            .map(|leg| leg.health)
            .max()
            .unwrap_or(Health::Healthy);
        let label = if group.link.is_empty() {
            format!("{a} <-> {b}")
        } else {
            format!("{a} <-> {b} ({})", group.link)
        };

        DuplexConnection {
            label,
            endpoint_a: a,
            endpoint_b: b,
            link: group.link,
            pending_total: pending_requests.unwrap_or(0) + pending_responses.unwrap_or(0),
            pending_requests,
            pending_responses,
            last_recv_age_ns: group.legs.iter().filter_map(|leg| leg.last_recv_age_ns).max(),
            last_sent_age_ns: group.legs.iter().filter_map(|leg| leg.last_sent_age_ns).max(),
            health,
            legs: group.legs,
            key,
        }
    }
}

/// Keeps at most one leg per direction, preferring the worse one.
fn push_leg(legs: &mut Vec<ConnectionLeg>, leg: ConnectionLeg) {
    let existing = legs.iter_mut().find(|existing| {
        existing.direction_from == leg.direction_from && existing.direction_to == leg.direction_to
    });
    match existing {
        Some(existing) => {
            debug!(
                kept = ?existing.node_id,
                other = ?leg.node_id,
                "duplicate connection leg for one direction"
            );
            if leg.health > existing.health {
                *existing = leg;
            }
        }
        None => legs.push(leg),
    }
}

fn sum_present(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values.fold(None, |acc, value| match (acc, value) {
        (None, None) => None,
        (acc, value) => Some(acc.unwrap_or(0) + value.unwrap_or(0)),
    })
}

/// Attributes used by renderers to label a connection node directly.
pub fn connection_label(attrs: &AttrBag, fallback: &str) -> String {
    attrs
        .string(keys::CONNECTION_TOKEN)
        .and_then(|token| parse_token(&token))
        .map(|(src, dst, _)| format!("{src} -> {dst}"))
        .unwrap_or_else(|| fallback.to_string())
}
