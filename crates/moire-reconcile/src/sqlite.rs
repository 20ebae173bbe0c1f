//! Local snapshot store backed by SQLite.
//!
//! Each query first shadows the snapshot tables with TEMP VIEWs filtered to
//! the requested snapshot, so the logical queries in [`crate::query`] run
//! unchanged against either this store or the HTTP collaborator.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::model::{Edge, Node, ProcessInfo, TimelineEvent};
use crate::query::{QueryResponse, SnapshotQuery, SqlQuery};

pub const MAX_ROWS: usize = 5000;
const PROGRESS_HANDLER_OPS: i32 = 1000;

/// `(table, columns other than snapshot_id)`
const SCOPED_TABLES: &[(&str, &str)] = &[
    ("nodes", "id, kind, process, proc_key, attrs_json"),
    ("edges", "src_id, dst_id, kind, attrs_json"),
    (
        "snapshot_processes",
        "process, pid, proc_key, status, recv_at_ns, error_text",
    ),
    (
        "events",
        "id, ts_ns, proc_key, entity_id, parent_entity_id, name, attrs_json",
    ),
    ("snapshots", "requested_at_ns, completed_at_ns"),
];

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        snapshot_id     INTEGER PRIMARY KEY,
        requested_at_ns INTEGER NOT NULL,
        completed_at_ns INTEGER
    );

    CREATE TABLE IF NOT EXISTS snapshot_processes (
        snapshot_id INTEGER NOT NULL,
        process     TEXT    NOT NULL,
        pid         INTEGER,
        proc_key    TEXT    NOT NULL,
        status      TEXT    NOT NULL,
        recv_at_ns  INTEGER,
        error_text  TEXT,
        PRIMARY KEY (snapshot_id, proc_key)
    );

    CREATE TABLE IF NOT EXISTS nodes (
        snapshot_id INTEGER NOT NULL,
        id          TEXT    NOT NULL,
        kind        TEXT    NOT NULL,
        process     TEXT    NOT NULL,
        proc_key    TEXT    NOT NULL,
        attrs_json  TEXT,
        PRIMARY KEY (snapshot_id, id)
    );

    CREATE TABLE IF NOT EXISTS edges (
        snapshot_id INTEGER NOT NULL,
        src_id      TEXT    NOT NULL,
        dst_id      TEXT    NOT NULL,
        kind        TEXT    NOT NULL,
        attrs_json  TEXT
    );

    CREATE TABLE IF NOT EXISTS events (
        snapshot_id      INTEGER NOT NULL,
        id               TEXT    NOT NULL,
        ts_ns            INTEGER NOT NULL,
        proc_key         TEXT    NOT NULL,
        entity_id        TEXT    NOT NULL,
        parent_entity_id TEXT,
        name             TEXT    NOT NULL,
        attrs_json       TEXT,
        PRIMARY KEY (snapshot_id, id)
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_snapshot_kind ON nodes(snapshot_id, kind);
    CREATE INDEX IF NOT EXISTS idx_edges_snapshot_src ON edges(snapshot_id, src_id);
    CREATE INDEX IF NOT EXISTS idx_events_entity ON events(snapshot_id, proc_key, entity_id, ts_ns);
    CREATE INDEX IF NOT EXISTS idx_events_parent ON events(snapshot_id, proc_key, parent_entity_id, ts_ns);
";

#[derive(Clone)]
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
    max_execution: Duration,
}

impl std::fmt::Debug for SqliteSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSnapshotStore")
            .field("max_execution", &self.max_execution)
            .finish_non_exhaustive()
    }
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_execution: Duration::from_millis(750),
        })
    }

    pub fn with_max_execution(mut self, max_execution: Duration) -> Self {
        self.max_execution = max_execution;
        self
    }

    pub fn insert_snapshot(
        &self,
        snapshot_id: i64,
        requested_at_ns: i64,
        completed_at_ns: Option<i64>,
    ) -> Result<(), QueryError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO snapshots(snapshot_id, requested_at_ns, completed_at_ns) VALUES (?1, ?2, ?3)",
            params![snapshot_id, requested_at_ns, completed_at_ns],
        )?;
        Ok(())
    }

    /// Records a process. Its command line, when known, is stored the way
    /// producers report it: as a `command` node in that process.
    pub fn insert_process(&self, snapshot_id: i64, info: &ProcessInfo) -> Result<(), QueryError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR REPLACE INTO snapshot_processes(snapshot_id, process, pid, proc_key, status) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![snapshot_id, info.process, info.pid, info.proc_key, info.status],
            )?;
        }
        if info.command.is_some() || info.args_preview.is_some() {
            let attrs = serde_json::json!({
                "cmd": { "program": info.command, "args_preview": info.args_preview }
            });
            let node = Node::new(format!("command:{}", info.proc_key), "command")
                .in_process(info.process.clone(), info.proc_key.clone())
                .with_attrs(attrs);
            self.insert_node(snapshot_id, &node)?;
        }
        Ok(())
    }

    pub fn insert_node(&self, snapshot_id: i64, node: &Node) -> Result<(), QueryError> {
        let attrs_json = encode_attrs(&node.attrs)?;
        self.insert_node_raw(snapshot_id, node, Some(&attrs_json))
    }

    /// Inserts a node with `attrs_json` stored verbatim, valid or not.
    pub fn insert_node_raw(
        &self,
        snapshot_id: i64,
        node: &Node,
        attrs_json: Option<&str>,
    ) -> Result<(), QueryError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO nodes(snapshot_id, id, kind, process, proc_key, attrs_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![snapshot_id, node.id, node.kind, node.process, node.proc_key, attrs_json],
        )?;
        Ok(())
    }

    pub fn insert_edge(&self, snapshot_id: i64, edge: &Edge) -> Result<(), QueryError> {
        let attrs_json = encode_attrs(&edge.attrs)?;
        self.conn.lock().execute(
            "INSERT INTO edges(snapshot_id, src_id, dst_id, kind, attrs_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![snapshot_id, edge.src_id, edge.dst_id, edge.kind, attrs_json],
        )?;
        Ok(())
    }

    pub fn insert_event(&self, snapshot_id: i64, event: &TimelineEvent) -> Result<(), QueryError> {
        let attrs_json = encode_attrs(&event.attrs)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO events(snapshot_id, id, ts_ns, proc_key, entity_id, parent_entity_id, name, attrs_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id,
                event.id,
                event.ts_ns,
                event.proc_key,
                event.entity_id,
                event.parent_entity_id,
                event.name,
                attrs_json
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotQuery for SqliteSnapshotStore {
    async fn query(&self, snapshot_id: i64, query: &SqlQuery) -> Result<QueryResponse, QueryError> {
        let conn = Arc::clone(&self.conn);
        let query = query.clone();
        let deadline = Instant::now() + self.max_execution;
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            run_scoped(&conn, snapshot_id, &query, deadline)
        })
        .await?;
        match &result {
            Ok(response) => debug!(
                snapshot_id,
                row_count = response.rows.len(),
                truncated = response.truncated,
                "sqlite query"
            ),
            Err(err) => warn!(snapshot_id, %err, "sqlite query failed"),
        }
        result
    }
}

fn run_scoped(
    conn: &Connection,
    snapshot_id: i64,
    query: &SqlQuery,
    deadline: Instant,
) -> Result<QueryResponse, QueryError> {
    let sql = query.sql.trim();
    if sql.is_empty() {
        return Err(QueryError::Rejected("empty SQL".to_string()));
    }
    create_scoped_views(conn, snapshot_id)?;
    conn.progress_handler(PROGRESS_HANDLER_OPS, Some(move || Instant::now() > deadline));
    let result = run_statement(conn, sql, &query.params);
    conn.progress_handler(0, None::<fn() -> bool>);
    result
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[Value],
) -> Result<QueryResponse, QueryError> {
    let mut stmt = conn.prepare(sql)?;
    for (i, value) in convert_params(params)?.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }

    let column_count = stmt.column_count();
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut truncated = false;
    let mut raw_rows = stmt.raw_query();
    loop {
        let row = match raw_rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) if is_interrupt_error(&e) => {
                truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if rows.len() >= MAX_ROWS {
            truncated = true;
            break;
        }
        rows.push((0..column_count).map(|i| sqlite_value_to_json(row, i)).collect());
    }

    Ok(QueryResponse {
        columns,
        rows,
        truncated,
    })
}

fn create_scoped_views(conn: &Connection, snapshot_id: i64) -> rusqlite::Result<()> {
    for (table, cols) in SCOPED_TABLES {
        conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS temp.[{table}];
             CREATE TEMP VIEW [{table}] AS SELECT {cols} FROM main.[{table}] WHERE snapshot_id = {snapshot_id}"
        ))?;
    }
    Ok(())
}

fn is_interrupt_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::OperationInterrupted,
                ..
            },
            _
        )
    )
}

fn convert_params(params: &[Value]) -> Result<Vec<SqlValue>, QueryError> {
    params
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Null => Ok(SqlValue::Null),
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Integer)
                .or_else(|| n.as_f64().map(SqlValue::Real))
                .ok_or_else(|| {
                    QueryError::Rejected(format!("param {}: unsupported number", i + 1))
                }),
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            _ => Err(QueryError::Rejected(format!(
                "param {}: unsupported type (object/array)",
                i + 1
            ))),
        })
        .collect()
}

fn sqlite_value_to_json(row: &rusqlite::Row<'_>, idx: usize) -> Value {
    match row.get_ref(idx) {
        Ok(ValueRef::Null) | Ok(ValueRef::Blob(_)) | Err(_) => Value::Null,
        Ok(ValueRef::Integer(i)) => Value::Number(i.into()),
        Ok(ValueRef::Real(f)) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ok(ValueRef::Text(bytes)) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn encode_attrs(attrs: &crate::attrs::AttrBag) -> Result<String, QueryError> {
    serde_json::to_string(attrs).map_err(|e| QueryError::Decode(format!("encode attrs: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EDGES_SQL, NODES_SQL, decode_edges, decode_nodes};
    use serde_json::json;

    fn first_page(sql: &str) -> SqlQuery {
        SqlQuery::new(sql).bind(100_u64).bind(0_u64)
    }

    fn store() -> SqliteSnapshotStore {
        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        for snapshot_id in [1, 2] {
            store.insert_snapshot(snapshot_id, 1_000, Some(2_000)).unwrap();
        }
        store
            .insert_node(1, &Node::new("b", "mutex").in_process("app", "app-1"))
            .unwrap();
        store
            .insert_node(1, &Node::new("a", "task").in_process("app", "app-1"))
            .unwrap();
        store
            .insert_node(2, &Node::new("other", "task").in_process("app", "app-1"))
            .unwrap();
        store.insert_edge(1, &Edge::new("a", "b", "needs")).unwrap();
        store.insert_edge(1, &Edge::new("a", "b", "needs")).unwrap();
        store
    }

    #[tokio::test]
    async fn views_are_scoped_to_the_snapshot() {
        let store = store();
        let one = store.query(1, &first_page(NODES_SQL)).await.unwrap();
        let ids: Vec<_> = decode_nodes(&one).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, ["a", "b"]);

        let two = store.query(2, &first_page(NODES_SQL)).await.unwrap();
        assert_eq!(two.rows.len(), 1);

        let edges = store.query(1, &first_page(EDGES_SQL)).await.unwrap();
        assert_eq!(decode_edges(&edges).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn listings_page_by_offset() {
        let store = store();
        let second = SqlQuery::new(NODES_SQL).bind(1_u64).bind(1_u64);
        let resp = store.query(1, &second).await.unwrap();
        let ids: Vec<_> = decode_nodes(&resp).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, ["b"]);
        assert!(!resp.truncated);
    }

    #[tokio::test]
    async fn deadline_interrupts_long_queries() {
        let store = SqliteSnapshotStore::open_in_memory()
            .unwrap()
            .with_max_execution(Duration::ZERO);
        let resp = store
            .query(
                1,
                &SqlQuery::new(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 100000) \
                     SELECT sum(x) FROM n",
                ),
            )
            .await
            .unwrap();
        assert!(resp.truncated);
        assert!(resp.rows.is_empty());
    }

    #[tokio::test]
    async fn binds_positional_params() {
        let store = store();
        let resp = store
            .query(
                1,
                &SqlQuery::new("SELECT id FROM nodes WHERE kind = ?1 AND ?2")
                    .bind("mutex")
                    .bind(true),
            )
            .await
            .unwrap();
        assert_eq!(resp.columns, ["id"]);
        assert_eq!(resp.rows, vec![vec![json!("b")]]);
    }

    #[tokio::test]
    async fn rejects_bad_sql() {
        let store = store();
        let empty = store.query(1, &SqlQuery::new("   ")).await.unwrap_err();
        assert!(matches!(empty, QueryError::Rejected(_)));

        let bad = store.query(1, &SqlQuery::new("SELECT * FROM nope")).await.unwrap_err();
        assert!(matches!(bad, QueryError::Backend(_)));

        let nested = store
            .query(1, &SqlQuery::new("SELECT ?1").bind(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(nested, QueryError::Rejected(_)));
    }

    #[tokio::test]
    async fn caps_rows() {
        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        let resp = store
            .query(
                1,
                &SqlQuery::new(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 6000) SELECT x FROM n",
                ),
            )
            .await
            .unwrap();
        assert_eq!(resp.rows.len(), MAX_ROWS);
        assert!(resp.truncated);
    }

    #[tokio::test]
    async fn raw_attrs_survive_storage() {
        let store = store();
        store
            .insert_node_raw(1, &Node::new("c", "task"), Some("{not json"))
            .unwrap();
        let resp = store.query(1, &first_page(NODES_SQL)).await.unwrap();
        let nodes = decode_nodes(&resp).unwrap();
        let c = nodes.iter().find(|n| n.id == "c").unwrap();
        assert!(c.attrs.is_empty());
    }
}
