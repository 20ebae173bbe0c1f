//! Runs the logical queries for one snapshot and feeds the reconcilers.

use tracing::{debug, info, warn};

use crate::duplex::{
    ConnectionView, DuplexConnection, DuplexOptions, DuplexResolver, HealthThresholds,
    PendingIndex, ProcessDirectory, apply_view,
};
use crate::error::QueryError;
use crate::graph::{Graph, build_graph};
use crate::kinds::{KindRegistry, NodeView, SummaryContext, describe_graph};
use crate::model::{Edge, Node, ProcessInfo, StuckRequest, TimelineEvent};
use crate::palette::ProcessPalette;
use crate::query::{
    self, CAPTURED_AT_SQL, EDGES_SQL, LISTING_PAGE_ROWS, NODES_SQL, PROCESSES_SQL, QueryResponse,
    RECENT_EVENTS_SQL, REQUEST_NODES_SQL, SnapshotQuery, SqlQuery,
};
use crate::timeline::{
    TimelineConfig, TimelineCursor, TimelinePage, TimelineRequest, assemble_page,
};

/// Read-only view of one snapshot through a [`SnapshotQuery`].
///
/// Holds no state besides its parameters; every method issues fresh
/// queries, so concurrent calls never interfere.
#[derive(Debug, Clone)]
pub struct SnapshotInspector<Q> {
    query: Q,
    snapshot_id: i64,
    pub thresholds: HealthThresholds,
    pub timeline: TimelineConfig,
    pub duplex: DuplexOptions,
}

impl<Q: SnapshotQuery> SnapshotInspector<Q> {
    pub fn new(query: Q, snapshot_id: i64) -> Self {
        Self {
            query,
            snapshot_id,
            thresholds: HealthThresholds::default(),
            timeline: TimelineConfig::default(),
            duplex: DuplexOptions::default(),
        }
    }

    pub fn snapshot_id(&self) -> i64 {
        self.snapshot_id
    }

    /// Runs one query. A truncated answer is an error: every caller here
    /// needs the complete result.
    async fn run(&self, query: &SqlQuery) -> Result<QueryResponse, QueryError> {
        let response = self.query.query(self.snapshot_id, query).await?;
        if response.truncated {
            let rows = response.rows.len();
            warn!(snapshot_id = self.snapshot_id, rows, "refusing truncated query result");
            return Err(QueryError::Truncated { rows });
        }
        Ok(response)
    }

    /// Every row of a paged listing, [`LISTING_PAGE_ROWS`] at a time.
    async fn list<T>(
        &self,
        sql: &str,
        decode: fn(&QueryResponse) -> Result<Vec<T>, QueryError>,
    ) -> Result<Vec<T>, QueryError> {
        let mut items = Vec::new();
        let mut offset = 0_u64;
        loop {
            let page = SqlQuery::new(sql)
                .bind(LISTING_PAGE_ROWS as u64)
                .bind(offset);
            let response = self.run(&page).await?;
            items.extend(decode(&response)?);
            if response.rows.len() < LISTING_PAGE_ROWS {
                return Ok(items);
            }
            offset += response.rows.len() as u64;
        }
    }

    pub async fn captured_at_ns(&self) -> Result<Option<i64>, QueryError> {
        let response = self.run(&SqlQuery::new(CAPTURED_AT_SQL)).await?;
        query::decode_captured_at(&response)
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, QueryError> {
        self.list(NODES_SQL, query::decode_nodes).await
    }

    pub async fn edges(&self) -> Result<Vec<Edge>, QueryError> {
        self.list(EDGES_SQL, query::decode_edges).await
    }

    /// Fetches nodes and edges concurrently, then builds the graph.
    pub async fn load_graph(&self) -> Result<Graph, QueryError> {
        let (nodes, edges) = tokio::try_join!(self.nodes(), self.edges())?;
        let graph = build_graph(nodes, edges);
        info!(
            snapshot_id = self.snapshot_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            ghosts = graph.ghost_nodes.len(),
            "graph loaded"
        );
        Ok(graph)
    }

    /// [`Self::load_graph`] plus a per-node summary and color.
    pub async fn load_node_views(
        &self,
        registry: &KindRegistry,
        palette: &mut ProcessPalette,
    ) -> Result<Vec<NodeView>, QueryError> {
        let (graph, captured_at_ns) = tokio::try_join!(self.load_graph(), self.captured_at_ns())?;
        let cx = SummaryContext {
            captured_at_ns,
            thresholds: self.thresholds,
        };
        Ok(describe_graph(&graph, registry, palette, &cx))
    }

    pub async fn process_options(&self) -> Result<Vec<ProcessInfo>, QueryError> {
        query::decode_processes(&self.run(&SqlQuery::new(PROCESSES_SQL)).await?)
    }

    /// Duplex rows for every connection in the snapshot, sorted and
    /// filtered per `view`.
    pub async fn load_connections(
        &self,
        view: &ConnectionView,
    ) -> Result<Vec<DuplexConnection>, QueryError> {
        let (nodes, processes, captured_at_ns) = tokio::try_join!(
            self.nodes(),
            self.process_options(),
            self.captured_at_ns()
        )?;
        let directory = ProcessDirectory::new(processes);
        let pending = PendingIndex::from_nodes(&nodes);
        let resolver = DuplexResolver {
            thresholds: self.thresholds,
            processes: &directory,
            captured_at_ns,
            options: self.duplex,
        };
        let rows = resolver.resolve_with_pending(&nodes, &pending);
        debug!(
            snapshot_id = self.snapshot_id,
            connections = rows.len(),
            "connections resolved"
        );
        Ok(apply_view(rows, view))
    }

    /// Requests in flight for at least `min_elapsed_secs`, longest first.
    pub async fn stuck_requests(
        &self,
        min_elapsed_secs: f64,
    ) -> Result<Vec<StuckRequest>, QueryError> {
        let min_elapsed_ns = (min_elapsed_secs.max(0.0) * 1e9).round() as i64;
        let (requests, captured_at_ns) = tokio::try_join!(
            self.list(REQUEST_NODES_SQL, query::decode_nodes),
            self.captured_at_ns()
        )?;
        Ok(query::select_stuck_requests(
            requests,
            captured_at_ns,
            min_elapsed_ns,
        ))
    }

    /// Newest events across all processes, at or before capture time.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<TimelineEvent>, QueryError> {
        let captured_at_ns = self.captured_at_ns().await?.unwrap_or(i64::MAX);
        let recent = SqlQuery::new(RECENT_EVENTS_SQL)
            .bind(captured_at_ns)
            .bind(limit as u64);
        query::decode_events(&self.run(&recent).await?)
    }

    /// Request for a timeline page bounded by this snapshot's capture time.
    pub async fn timeline_request(
        &self,
        proc_key: &str,
        entity_id: &str,
        limit: Option<usize>,
        cursor: Option<TimelineCursor>,
    ) -> Result<TimelineRequest, QueryError> {
        let captured_at_ns = self.captured_at_ns().await?.unwrap_or(i64::MAX);
        let mut request = TimelineRequest::first_page(
            proc_key,
            entity_id,
            captured_at_ns,
            limit.unwrap_or(self.timeline.page_size),
        );
        request.cursor = cursor;
        Ok(request)
    }

    /// One page of an entity's timeline. An interrupted query is an error,
    /// never a short page, so it cannot pass for the end of the timeline.
    pub async fn fetch_timeline_page(
        &self,
        request: &TimelineRequest,
    ) -> Result<TimelinePage, QueryError> {
        let response = self.run(&request.to_query()).await?;
        let events = query::decode_events(&response)?;
        Ok(assemble_page(request, events))
    }
}
