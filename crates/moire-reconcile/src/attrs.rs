//! Typed access to loosely-keyed attribute bags.
//!
//! Producers have renamed attribute keys several times, so every logical
//! field is read through an ordered alias list (most canonical first) from
//! [`keys`]. Call sites never index a bag by a bare string.

use serde::Serialize;
use serde_json::{Map, Value};

/// Values below this are seconds.
const SECS_CEILING: f64 = 1e11;
/// Values below this are milliseconds.
const MILLIS_CEILING: f64 = 1e14;
/// Values below this are microseconds; anything larger is nanoseconds.
const MICROS_CEILING: f64 = 1e17;

pub mod keys {
    //! Alias tables, most canonical key first.

    pub const LABEL: &[&str] = &["label", "name", "rpc.name", "method", "resource"];
    pub const STATUS: &[&str] = &["status", "state", "rpc.status"];
    pub const METHOD: &[&str] = &["method", "rpc.method", "method_name", "rpc.name"];

    pub const CREATED_AT: &[&str] = &["created_at_ns", "created_at", "birth_ns", "birth"];
    pub const QUEUED_AT: &[&str] = &["queued_at_ns", "queued_at", "enqueued_at"];
    pub const STARTED_AT: &[&str] = &["started_at_ns", "started_at", "start_ns"];

    pub const ELAPSED_NS: &[&str] = &["elapsed_ns", "rpc.elapsed_ns"];
    pub const ELAPSED_MS: &[&str] = &["elapsed_ms", "rpc.elapsed_ms"];
    pub const ELAPSED_SECS: &[&str] = &["elapsed_secs", "elapsed_s", "age_secs"];

    pub const CONNECTION_TOKEN: &[&str] = &[
        "connection.token",
        "connection",
        "conn",
        "rpc.connection",
        "net.connection",
    ];
    pub const CONNECTION_SRC: &[&str] = &[
        "connection.src",
        "conn.src",
        "src",
        "local",
        "net.local",
    ];
    pub const CONNECTION_DST: &[&str] = &[
        "connection.dst",
        "conn.dst",
        "dst",
        "peer",
        "net.peer",
        "remote",
    ];
    pub const CONNECTION_LINK: &[&str] = &["connection.link", "conn.link", "link", "link_id"];
    pub const CONNECTION_STATE: &[&str] = &["connection.state", "conn.state", "state", "status"];

    pub const PENDING_REQUESTS: &[&str] = &[
        "connection.pending_requests",
        "pending_requests",
        "in_flight_requests",
        "pending_request_count",
    ];
    pub const PENDING_RESPONSES: &[&str] = &[
        "connection.pending_responses",
        "pending_responses",
        "in_flight_responses",
        "pending_response_count",
    ];

    pub const LAST_RECV_AGO_NS: &[&str] = &["connection.last_recv_ago_ns", "last_recv_ago_ns"];
    pub const LAST_RECV_AGO_SECS: &[&str] = &[
        "connection.last_recv_ago_secs",
        "last_recv_ago_secs",
        "last_received_ago_secs",
    ];
    pub const LAST_RECV_AT: &[&str] = &[
        "connection.last_recv_at_ns",
        "last_recv_at_ns",
        "last_recv_at",
        "last_received_at",
    ];
    pub const LAST_SENT_AGO_NS: &[&str] = &["connection.last_sent_ago_ns", "last_sent_ago_ns"];
    pub const LAST_SENT_AGO_SECS: &[&str] = &[
        "connection.last_sent_ago_secs",
        "last_sent_ago_secs",
        "last_send_ago_secs",
    ];
    pub const LAST_SENT_AT: &[&str] = &[
        "connection.last_sent_at_ns",
        "last_sent_at_ns",
        "last_sent_at",
        "last_send_at",
    ];

    pub const REQUEST_SRC: &[&str] = &["rpc.src", "request.src", "src", "from"];
    pub const REQUEST_DST: &[&str] = &["rpc.dst", "request.dst", "dst", "to"];

    pub const WAITERS: &[&str] = &["waiters", "waiter_count", "lock.waiters", "send_waiters"];
    pub const HOLDERS: &[&str] = &["holders", "holder_count", "lock.holders"];
    pub const QUEUE_LEN: &[&str] = &["queue_len", "pending", "buffered"];
    pub const CAPACITY: &[&str] = &["capacity", "bound", "max_capacity"];

    pub const CMD_PROGRAM: &[&str] = &["cmd.program", "program", "command"];
    pub const CMD_ARGS: &[&str] = &["cmd.args_preview", "args_preview"];
}

/// Alias groups for an "age" that producers report either directly or as
/// an absolute timestamp to be measured against the capture time.
#[derive(Debug, Clone, Copy)]
pub struct AgeAliases {
    pub ns: &'static [&'static str],
    pub ms: &'static [&'static str],
    pub secs: &'static [&'static str],
    pub at: &'static [&'static str],
}

pub const LAST_RECV_AGE: AgeAliases = AgeAliases {
    ns: keys::LAST_RECV_AGO_NS,
    ms: &[],
    secs: keys::LAST_RECV_AGO_SECS,
    at: keys::LAST_RECV_AT,
};

pub const LAST_SENT_AGE: AgeAliases = AgeAliases {
    ns: keys::LAST_SENT_AGO_NS,
    ms: &[],
    secs: keys::LAST_SENT_AGO_SECS,
    at: keys::LAST_SENT_AT,
};

pub const ELAPSED: AgeAliases = AgeAliases {
    ns: keys::ELAPSED_NS,
    ms: keys::ELAPSED_MS,
    secs: keys::ELAPSED_SECS,
    at: keys::STARTED_AT,
};

/// Immutable key/value attributes of one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttrBag {
    map: Map<String, Value>,
}

impl AttrBag {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses an `attrs_json` column. Absent, malformed, or non-object JSON
    /// yields an empty bag.
    pub fn parse(json: Option<&str>) -> Self {
        let Some(text) = json.map(str::trim).filter(|text| !text.is_empty()) else {
            return Self::empty();
        };
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::from_value(value),
            Err(error) => {
                tracing::debug!(%error, "malformed attrs_json, using empty attribute bag");
                Self::empty()
            }
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { map },
            other => {
                tracing::debug!(kind = value_kind(&other), "attrs_json is not an object");
                Self::empty()
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// First present, non-empty value among `aliases`.
    pub fn first(&self, aliases: &[&str]) -> Option<&Value> {
        aliases
            .iter()
            .filter_map(|key| self.lookup(key))
            .find(|value| !is_empty_value(value))
    }

    pub fn string(&self, aliases: &[&str]) -> Option<String> {
        match self.first(aliases)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Numeric value of the first present alias. A non-numeric value is
    /// absent, not zero.
    pub fn number(&self, aliases: &[&str]) -> Option<f64> {
        value_to_f64(self.first(aliases)?)
    }

    /// Non-negative integral count.
    pub fn count(&self, aliases: &[&str]) -> Option<u64> {
        let value = self.first(aliases)?;
        if let Some(n) = value.as_u64() {
            return Some(n);
        }
        let n = value_to_f64(value)?;
        (n >= 0.0 && n.fract() == 0.0 && n <= u64::MAX as f64).then_some(n as u64)
    }

    pub fn boolean(&self, aliases: &[&str]) -> Option<bool> {
        match self.first(aliases)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|n| n != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Timestamp of the first present alias, normalized to nanoseconds.
    pub fn timestamp_ns(&self, aliases: &[&str]) -> Option<i64> {
        match self.first(aliases)? {
            Value::Number(n) => match n.as_i64() {
                Some(int) => normalize_timestamp_ns_int(int),
                None => n.as_f64().and_then(normalize_timestamp_ns),
            },
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(int) => normalize_timestamp_ns_int(int),
                    Err(_) => s.parse::<f64>().ok().and_then(normalize_timestamp_ns),
                }
            }
            _ => None,
        }
    }

    /// Age in nanoseconds: a direct age attribute wins, otherwise the time
    /// between an absolute timestamp and `now_ns`.
    pub fn age_ns(&self, aliases: &AgeAliases, now_ns: Option<i64>) -> Option<i64> {
        if let Some(ns) = self.number(aliases.ns) {
            return non_negative_ns(ns);
        }
        if let Some(ms) = self.number(aliases.ms) {
            return non_negative_ns(ms * 1e6);
        }
        if let Some(secs) = self.number(aliases.secs) {
            return non_negative_ns(secs * 1e9);
        }
        duration_ns(self.timestamp_ns(aliases.at), now_ns)
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.map.get(key) {
            return Some(value);
        }
        // "cmd.program" may be a flat key or a nested path.
        let mut parts = key.split('.');
        let mut current = self.map.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

/// Normalizes a timestamp of unknown unit to nanoseconds by magnitude.
pub fn normalize_timestamp_ns(raw: f64) -> Option<i64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let scaled = raw * scale_for(raw) as f64;
    (scaled <= i64::MAX as f64).then(|| scaled.round() as i64)
}

/// Integer form of [`normalize_timestamp_ns`], exact for large values.
pub fn normalize_timestamp_ns_int(raw: i64) -> Option<i64> {
    if raw < 0 {
        return None;
    }
    raw.checked_mul(scale_for(raw as f64))
}

fn scale_for(raw: f64) -> i64 {
    if raw < SECS_CEILING {
        1_000_000_000
    } else if raw < MILLIS_CEILING {
        1_000_000
    } else if raw < MICROS_CEILING {
        1_000
    } else {
        1
    }
}

/// Elapsed time between two normalized timestamps. Absent unless both ends
/// are known and `end >= start`.
pub fn duration_ns(start_ns: Option<i64>, end_ns: Option<i64>) -> Option<i64> {
    let (start, end) = (start_ns?, end_ns?);
    if end < start {
        return None;
    }
    end.checked_sub(start)
}

fn non_negative_ns(ns: f64) -> Option<i64> {
    (ns.is_finite() && ns >= 0.0 && ns <= i64::MAX as f64).then(|| ns.round() as i64)
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
