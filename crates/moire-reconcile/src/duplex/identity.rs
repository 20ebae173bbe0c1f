//! Connection identity: endpoint parsing and order-independent keys.

use serde::Serialize;

use crate::attrs::keys;
use crate::model::Node;

pub const UNKNOWN_ENDPOINT: &str = "unknown";

const TOKEN_PREFIXES: &[&str] = &["connection:", "conn:"];

/// Direction and link of one connection observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionIdentity {
    /// Raw token as reported, before direction was parsed out.
    pub token: String,
    pub src: String,
    pub dst: String,
    pub link: String,
    /// False when the token could not be split into two endpoints.
    pub parsed: bool,
}

impl ConnectionIdentity {
    pub fn unknown(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            link: token.clone(),
            token,
            src: UNKNOWN_ENDPOINT.to_string(),
            dst: UNKNOWN_ENDPOINT.to_string(),
            parsed: false,
        }
    }

    /// `(endpoint_a, endpoint_b)` with `endpoint_a <= endpoint_b`.
    pub fn endpoints(&self) -> (&str, &str) {
        ordered_pair(&self.src, &self.dst)
    }

    pub fn row_key(&self) -> String {
        duplex_row_key(&self.src, &self.dst, &self.link)
    }

    pub fn canonical_token(&self) -> String {
        if self.parsed {
            canonical_token(&self.src, &self.dst, &self.link)
        } else {
            self.token.trim().to_string()
        }
    }
}

/// Splits `src->dst:link` (optionally prefixed with `conn:`) into parts.
pub fn parse_token(token: &str) -> Option<(String, String, String)> {
    let mut body = token.trim();
    for prefix in TOKEN_PREFIXES {
        if let Some(rest) = body.strip_prefix(prefix) {
            body = rest;
            break;
        }
    }
    let (src, rest) = body.split_once("->")?;
    let (dst, link) = match rest.rsplit_once(':') {
        Some((dst, link)) if !dst.trim().is_empty() => (dst, link),
        _ => (rest, ""),
    };
    let (src, dst) = (src.trim(), dst.trim());
    if src.is_empty() || dst.is_empty() {
        return None;
    }
    Some((src.to_string(), dst.to_string(), link.trim().to_string()))
}

/// Resolves a connection node's identity: structured attributes first,
/// then the combined token, then the `unknown` pair.
pub fn resolve_identity(node: &Node) -> ConnectionIdentity {
    let token = node
        .attrs
        .string(keys::CONNECTION_TOKEN)
        .unwrap_or_else(|| node.id.clone());
    let parsed = parse_token(&token);

    let src = node.attrs.string(keys::CONNECTION_SRC);
    let dst = node.attrs.string(keys::CONNECTION_DST);
    if let (Some(src), Some(dst)) = (src, dst) {
        let link = node
            .attrs
            .string(keys::CONNECTION_LINK)
            .or_else(|| parsed.as_ref().map(|(_, _, link)| link.clone()))
            .unwrap_or_default();
        return ConnectionIdentity {
            token,
            src,
            dst,
            link,
            parsed: true,
        };
    }

    match parsed {
        Some((src, dst, link)) => {
            let link = node.attrs.string(keys::CONNECTION_LINK).unwrap_or(link);
            ConnectionIdentity {
                token,
                src,
                dst,
                link,
                parsed: true,
            }
        }
        None => {
            tracing::debug!(node_id = %node.id, %token, "unparseable connection token");
            ConnectionIdentity::unknown(token)
        }
    }
}

pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Order-independent key for an endpoint pair: `duplex_key(a, b) == duplex_key(b, a)`.
pub fn duplex_key(a: &str, b: &str) -> String {
    let (lo, hi) = ordered_pair(a, b);
    format!("{lo}<->{hi}")
}

/// Row key: the pair key, plus `:link` when a link id is known.
pub fn duplex_row_key(a: &str, b: &str, link: &str) -> String {
    let key = duplex_key(a, b);
    if link.is_empty() {
        key
    } else {
        format!("{key}:{link}")
    }
}

pub fn canonical_token(src: &str, dst: &str, link: &str) -> String {
    if link.is_empty() {
        format!("{src}->{dst}")
    } else {
        format!("{src}->{dst}:{link}")
    }
}
