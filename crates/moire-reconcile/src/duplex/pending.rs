//! Unresolved request/response references grouped by connection.

use std::collections::BTreeMap;

use serde::Serialize;

use super::identity::{ConnectionIdentity, canonical_token, duplex_row_key, parse_token};
use crate::attrs::keys;
use crate::model::Node;

const RESOLVED_STATUSES: &[&str] = &[
    "completed",
    "complete",
    "done",
    "resolved",
    "responded",
    "delivered",
    "cancelled",
    "canceled",
];

/// Request and response node ids still in flight on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingRefs {
    pub request_ids: Vec<String>,
    pub response_ids: Vec<String>,
}

impl PendingRefs {
    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty() && self.response_ids.is_empty()
    }

    fn push(&mut self, kind: PendingKind, id: &str) {
        let ids = match kind {
            PendingKind::Request => &mut self.request_ids,
            PendingKind::Response => &mut self.response_ids,
        };
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Request,
    Response,
}

/// `(row key, src, dst)`: the per-direction key.
type DirectionKey = (String, String, String);

/// Pending references indexed by connection token and, when the request
/// carries explicit endpoints, by direction.
#[derive(Debug, Clone, Default)]
pub struct PendingIndex {
    by_token: BTreeMap<String, PendingRefs>,
    by_direction: BTreeMap<DirectionKey, PendingRefs>,
}

impl PendingIndex {
    /// Scans `request` and `response` nodes; other kinds are ignored.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut index = Self::default();
        for node in nodes {
            let kind = match node.kind.as_str() {
                "request" => PendingKind::Request,
                "response" => PendingKind::Response,
                _ => continue,
            };
            if is_resolved(node) {
                continue;
            }
            let Some(raw_token) = node.attrs.string(keys::CONNECTION_TOKEN) else {
                continue;
            };
            let parsed = parse_token(&raw_token);
            let token = match &parsed {
                Some((src, dst, link)) => canonical_token(src, dst, link),
                None => raw_token.trim().to_string(),
            };
            index.by_token.entry(token).or_default().push(kind, &node.id);

            let src = node
                .attrs
                .string(keys::REQUEST_SRC)
                .or_else(|| parsed.as_ref().map(|(src, _, _)| src.clone()));
            let dst = node
                .attrs
                .string(keys::REQUEST_DST)
                .or_else(|| parsed.as_ref().map(|(_, dst, _)| dst.clone()));
            if let (Some(src), Some(dst)) = (src, dst) {
                let link = node
                    .attrs
                    .string(keys::CONNECTION_LINK)
                    .or_else(|| parsed.as_ref().map(|(_, _, link)| link.clone()))
                    .unwrap_or_default();
                let key = (duplex_row_key(&src, &dst, &link), src, dst);
                index.by_direction.entry(key).or_default().push(kind, &node.id);
            }
        }
        index
    }

    pub fn for_token(&self, token: &str) -> Option<&PendingRefs> {
        self.by_token.get(token)
    }

    /// Most specific match for one direction of a connection: the
    /// `(row key, src, dst)` entry, else the token entry.
    pub fn lookup(&self, identity: &ConnectionIdentity) -> Option<&PendingRefs> {
        let key = (
            identity.row_key(),
            identity.src.clone(),
            identity.dst.clone(),
        );
        self.by_direction
            .get(&key)
            .or_else(|| self.by_token.get(&identity.canonical_token()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty() && self.by_direction.is_empty()
    }
}

fn is_resolved(node: &Node) -> bool {
    node.attrs
        .string(keys::STATUS)
        .map(|status| {
            let status = status.to_ascii_lowercase();
            RESOLVED_STATUSES.contains(&status.as_str())
        })
        .unwrap_or(false)
}
