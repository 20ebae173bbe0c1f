//! The logical query catalogue and the capability that runs it.
//!
//! Every query runs against one snapshot. The executor scopes the `nodes`,
//! `edges`, `snapshot_processes`, `events` and `snapshots` relations to
//! that snapshot, so none of the SQL below mentions a snapshot id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::attrs::{self, AttrBag, keys};
use crate::error::QueryError;
use crate::model::{Edge, Node, ProcessInfo, StuckRequest, TimelineEvent};

/// Most rows a stuck-request listing returns.
pub const STUCK_REQUEST_LIMIT: usize = 500;

/// Rows per page of a full listing; below every executor's row cap.
pub const LISTING_PAGE_ROWS: usize = 2000;

/// Paged listings bind `?1`: page size, `?2`: offset. Their `ORDER BY`
/// covers every column so pages never overlap.
pub const NODES_SQL: &str = "SELECT id, kind, process, proc_key, attrs_json \
     FROM nodes ORDER BY id LIMIT ?1 OFFSET ?2";

pub const EDGES_SQL: &str = "SELECT src_id, dst_id, kind, attrs_json \
     FROM edges ORDER BY src_id, dst_id, kind, attrs_json LIMIT ?1 OFFSET ?2";

pub const REQUEST_NODES_SQL: &str = "SELECT id, kind, process, proc_key, attrs_json \
     FROM nodes WHERE kind = 'request' ORDER BY id LIMIT ?1 OFFSET ?2";

pub const PROCESSES_SQL: &str = "WITH command_nodes AS (
    SELECT proc_key,
           MAX(CASE WHEN json_valid(attrs_json) THEN COALESCE(
               json_extract(attrs_json, '$.cmd.program'),
               json_extract(attrs_json, '$.\"cmd.program\"')
           ) END) AS command,
           MAX(CASE WHEN json_valid(attrs_json) THEN COALESCE(
               json_extract(attrs_json, '$.cmd.args_preview'),
               json_extract(attrs_json, '$.\"cmd.args_preview\"')
           ) END) AS cmd_args_preview
    FROM nodes
    WHERE kind = 'command'
    GROUP BY proc_key
)
SELECT sp.process, sp.pid, sp.proc_key, sp.status, cn.command, cn.cmd_args_preview
FROM snapshot_processes AS sp
LEFT JOIN command_nodes AS cn ON cn.proc_key = sp.proc_key
ORDER BY sp.process, sp.proc_key";

/// `?1`: proc key, `?2`: entity id, `?3`: capture time, `?4`: limit.
pub const TIMELINE_SQL: &str = "SELECT id, ts_ns, proc_key, entity_id, parent_entity_id, name, attrs_json
FROM events
WHERE proc_key = ?1
  AND (entity_id = ?2 OR parent_entity_id = ?2)
  AND ts_ns <= ?3
ORDER BY ts_ns DESC, id DESC
LIMIT ?4";

/// [`TIMELINE_SQL`] restricted to rows strictly older than the cursor
/// `(?5, ?6)` under `(ts_ns DESC, id DESC)`.
pub const TIMELINE_AFTER_CURSOR_SQL: &str = "SELECT id, ts_ns, proc_key, entity_id, parent_entity_id, name, attrs_json
FROM events
WHERE proc_key = ?1
  AND (entity_id = ?2 OR parent_entity_id = ?2)
  AND ts_ns <= ?3
  AND (ts_ns < ?5 OR (ts_ns = ?5 AND id < ?6))
ORDER BY ts_ns DESC, id DESC
LIMIT ?4";

/// `?1`: capture time, `?2`: limit.
pub const RECENT_EVENTS_SQL: &str = "SELECT id, ts_ns, proc_key, entity_id, parent_entity_id, name, attrs_json
FROM events
WHERE ts_ns <= ?1
ORDER BY ts_ns DESC, id DESC
LIMIT ?2";

pub const CAPTURED_AT_SQL: &str =
    "SELECT COALESCE(completed_at_ns, requested_at_ns) AS captured_at_ns FROM snapshots";

/// One parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Body of `POST /api/sql`.
#[derive(Debug, Serialize)]
pub struct SqlRequest<'a> {
    pub snapshot_id: i64,
    pub sql: &'a str,
    pub params: &'a [Value],
}

/// Tabular result: column names plus rows of JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub truncated: bool,
}

/// Parameterized query execution over one snapshot.
///
/// Implementations own timeouts; callers treat any error as terminal for
/// that request.
#[async_trait]
pub trait SnapshotQuery: Send + Sync {
    async fn query(&self, snapshot_id: i64, query: &SqlQuery) -> Result<QueryResponse, QueryError>;
}

#[async_trait]
impl<Q: SnapshotQuery + ?Sized> SnapshotQuery for std::sync::Arc<Q> {
    async fn query(&self, snapshot_id: i64, query: &SqlQuery) -> Result<QueryResponse, QueryError> {
        (**self).query(snapshot_id, query).await
    }
}

/// Column lookup by name, so decoders do not depend on column order.
pub struct RowReader {
    index: HashMap<String, usize>,
}

impl RowReader {
    pub fn new(response: &QueryResponse, required: &[&str]) -> Result<Self, QueryError> {
        let index: HashMap<String, usize> = response
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        if let Some(missing) = required.iter().find(|name| !index.contains_key(**name)) {
            return Err(QueryError::Decode(format!(
                "missing column {missing:?} (got {:?})",
                response.columns
            )));
        }
        Ok(Self { index })
    }

    pub fn value<'r>(&self, row: &'r [Value], column: &str) -> Option<&'r Value> {
        row.get(*self.index.get(column)?)
            .filter(|value| !value.is_null())
    }

    pub fn text(&self, row: &[Value], column: &str) -> Option<String> {
        match self.value(row, column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn int(&self, row: &[Value], column: &str) -> Option<i64> {
        match self.value(row, column)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

const NODE_COLUMNS: &[&str] = &["id", "kind", "process", "proc_key", "attrs_json"];
const EDGE_COLUMNS: &[&str] = &["src_id", "dst_id", "kind", "attrs_json"];
const EVENT_COLUMNS: &[&str] = &[
    "id",
    "ts_ns",
    "proc_key",
    "entity_id",
    "parent_entity_id",
    "name",
    "attrs_json",
];
const PROCESS_COLUMNS: &[&str] = &["process", "pid", "proc_key", "status"];

fn node_from_row(reader: &RowReader, row: &[Value]) -> Option<Node> {
    let Some(id) = reader.text(row, "id") else {
        debug!("skipping node row without id");
        return None;
    };
    Some(Node {
        id,
        kind: reader.text(row, "kind").unwrap_or_default(),
        process: reader.text(row, "process").unwrap_or_default(),
        proc_key: reader.text(row, "proc_key").unwrap_or_default(),
        attrs: AttrBag::parse(reader.text(row, "attrs_json").as_deref()),
    })
}

pub fn decode_nodes(response: &QueryResponse) -> Result<Vec<Node>, QueryError> {
    let reader = RowReader::new(response, NODE_COLUMNS)?;
    Ok(response
        .rows
        .iter()
        .filter_map(|row| node_from_row(&reader, row))
        .collect())
}

pub fn decode_edges(response: &QueryResponse) -> Result<Vec<Edge>, QueryError> {
    let reader = RowReader::new(response, EDGE_COLUMNS)?;
    Ok(response
        .rows
        .iter()
        .filter_map(|row| {
            let (Some(src_id), Some(dst_id)) =
                (reader.text(row, "src_id"), reader.text(row, "dst_id"))
            else {
                debug!("skipping edge row without endpoints");
                return None;
            };
            Some(Edge {
                src_id,
                dst_id,
                kind: reader.text(row, "kind").unwrap_or_default(),
                attrs: AttrBag::parse(reader.text(row, "attrs_json").as_deref()),
            })
        })
        .collect())
}

pub fn decode_events(response: &QueryResponse) -> Result<Vec<TimelineEvent>, QueryError> {
    let reader = RowReader::new(response, EVENT_COLUMNS)?;
    Ok(response
        .rows
        .iter()
        .filter_map(|row| {
            let (Some(id), Some(ts_ns)) = (reader.text(row, "id"), reader.int(row, "ts_ns")) else {
                debug!("skipping event row without id or timestamp");
                return None;
            };
            Some(TimelineEvent {
                id,
                ts_ns,
                proc_key: reader.text(row, "proc_key").unwrap_or_default(),
                entity_id: reader.text(row, "entity_id").unwrap_or_default(),
                parent_entity_id: reader.text(row, "parent_entity_id"),
                name: reader.text(row, "name").unwrap_or_default(),
                attrs: AttrBag::parse(reader.text(row, "attrs_json").as_deref()),
            })
        })
        .collect())
}

pub fn decode_processes(response: &QueryResponse) -> Result<Vec<ProcessInfo>, QueryError> {
    let reader = RowReader::new(response, PROCESS_COLUMNS)?;
    Ok(response
        .rows
        .iter()
        .filter_map(|row| {
            Some(ProcessInfo {
                process: reader.text(row, "process")?,
                pid: reader.int(row, "pid"),
                proc_key: reader.text(row, "proc_key").unwrap_or_default(),
                status: reader.text(row, "status").unwrap_or_default(),
                command: reader.text(row, "command"),
                args_preview: reader.text(row, "cmd_args_preview"),
            })
        })
        .collect())
}

/// Requests that have been in flight for at least `min_elapsed_ns`, longest
/// first, capped at [`STUCK_REQUEST_LIMIT`].
///
/// Elapsed time is resolved through the [`attrs::ELAPSED`] aliases, so a
/// request reporting only a start time is measured against `captured_at_ns`.
pub fn select_stuck_requests(
    requests: Vec<Node>,
    captured_at_ns: Option<i64>,
    min_elapsed_ns: i64,
) -> Vec<StuckRequest> {
    let mut stuck: Vec<StuckRequest> = requests
        .into_iter()
        .filter_map(|node| {
            let elapsed_ns = node.attrs.age_ns(&attrs::ELAPSED, captured_at_ns)?;
            if elapsed_ns < min_elapsed_ns {
                return None;
            }
            let method = node.attrs.string(keys::METHOD);
            Some(StuckRequest {
                node,
                elapsed_ns: Some(elapsed_ns),
                method,
            })
        })
        .collect();
    stuck.sort_by(|a, b| {
        b.elapsed_ns
            .cmp(&a.elapsed_ns)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    stuck.truncate(STUCK_REQUEST_LIMIT);
    stuck
}

/// The snapshot's capture time, normalized to nanoseconds.
pub fn decode_captured_at(response: &QueryResponse) -> Result<Option<i64>, QueryError> {
    let reader = RowReader::new(response, &["captured_at_ns"])?;
    Ok(response
        .rows
        .first()
        .and_then(|row| reader.int(row, "captured_at_ns"))
        .and_then(attrs::normalize_timestamp_ns_int))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResponse {
        QueryResponse {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            truncated: false,
        }
    }

    #[test]
    fn decodes_nodes_by_column_name() {
        let resp = response(
            &["attrs_json", "proc_key", "process", "kind", "id"],
            vec![
                vec![
                    json!(r#"{"label":"db"}"#),
                    json!("p-1"),
                    json!("app"),
                    json!("mutex"),
                    json!("m1"),
                ],
                vec![json!("{broken"), Value::Null, json!("app"), json!("task"), json!("t1")],
                vec![Value::Null, Value::Null, Value::Null, json!("task"), Value::Null],
            ],
        );
        let nodes = decode_nodes(&resp).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].attrs.string(keys::LABEL).as_deref(), Some("db"));
        assert_eq!(nodes[0].proc_key, "p-1");
        assert!(nodes[1].attrs.is_empty());
        assert_eq!(nodes[1].proc_key, "");
    }

    #[test]
    fn missing_column_is_a_decode_error() {
        let resp = response(&["id", "kind"], vec![]);
        let err = decode_nodes(&resp).unwrap_err();
        assert!(matches!(err, QueryError::Decode(_)));
    }

    fn request(id: &str, attrs: Value) -> Node {
        Node::new(id, "request").with_attrs(attrs)
    }

    #[test]
    fn stuck_requests_resolve_every_elapsed_alias() {
        let captured = 1_700_000_000_000_000_000_i64;
        let stuck = select_stuck_requests(
            vec![
                request("started", json!({"started_at_ns": captured - 40_000_000_000})),
                request(
                    "rpc",
                    json!({"rpc.elapsed_ns": 41_000_000_000_i64, "method": "get_blob"}),
                ),
                request("ms", json!({"elapsed_ms": 6_000})),
                request("fresh", json!({"elapsed_secs": 1})),
                request("unknown", json!({})),
            ],
            Some(captured),
            5_000_000_000,
        );
        let ids: Vec<_> = stuck.iter().map(|s| s.node.id.as_str()).collect();
        assert_eq!(ids, ["rpc", "started", "ms"]);
        assert_eq!(stuck[0].method.as_deref(), Some("get_blob"));
        assert_eq!(stuck[1].elapsed_ns, Some(40_000_000_000));
    }

    #[test]
    fn stuck_requests_without_capture_time_skip_start_stamps() {
        let stuck = select_stuck_requests(
            vec![request(
                "started",
                json!({"started_at_ns": 1_000_000_000_000_000_000_i64}),
            )],
            None,
            0,
        );
        assert!(stuck.is_empty());
    }

    #[test]
    fn stuck_requests_are_capped() {
        let requests = (0..STUCK_REQUEST_LIMIT + 20)
            .map(|i| request(&format!("r{i:04}"), json!({"elapsed_secs": 10 + i})))
            .collect();
        let stuck = select_stuck_requests(requests, None, 0);
        assert_eq!(stuck.len(), STUCK_REQUEST_LIMIT);
        assert_eq!(stuck[0].node.id, format!("r{:04}", STUCK_REQUEST_LIMIT + 19));
    }

    #[test]
    fn captured_at_is_normalized() {
        let resp = response(&["captured_at_ns"], vec![vec![json!(1_700_000_000_000_i64)]]);
        assert_eq!(decode_captured_at(&resp).unwrap(), Some(1_700_000_000_000_000_000));
        let empty = response(&["captured_at_ns"], vec![]);
        assert_eq!(decode_captured_at(&empty).unwrap(), None);
    }

    #[test]
    fn sql_request_body_shape() {
        let query = SqlQuery::new(TIMELINE_SQL).bind("p-1").bind("e-1").bind(10_i64).bind(25_u64);
        let body = serde_json::to_value(SqlRequest {
            snapshot_id: 7,
            sql: &query.sql,
            params: &query.params,
        })
        .unwrap();
        assert_eq!(body["snapshot_id"], json!(7));
        assert_eq!(body["params"], json!(["p-1", "e-1", 10, 25]));
    }
}
