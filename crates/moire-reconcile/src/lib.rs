//! Reconciliation of moire snapshot rows into canonical views.
//!
//! A snapshot arrives as flat node, edge and event rows with loosely-keyed
//! attributes. This crate turns those rows into a consistent graph (with
//! ghost nodes for dangling edges), merged duplex connections, and
//! keyset-paginated entity timelines.

pub mod attrs;
pub mod client;
pub mod config;
pub mod duplex;
pub mod error;
pub mod graph;
pub mod inspector;
pub mod kinds;
pub mod model;
pub mod palette;
pub mod query;
pub mod session;
pub mod sqlite;
pub mod timeline;

pub use attrs::AttrBag;
pub use client::HttpSnapshotQuery;
pub use config::InspectConfig;
pub use duplex::{
    ConnectionLeg, ConnectionView, DuplexConnection, DuplexResolver, Health, HealthThresholds,
    SeverityFilter, SortDirection, SortKey, duplex_key,
};
pub use error::QueryError;
pub use graph::{Graph, build_graph};
pub use inspector::SnapshotInspector;
pub use kinds::{KindRegistry, NodeView};
pub use model::{Edge, Node, ProcessInfo, StuckRequest, TimelineEvent};
pub use palette::ProcessPalette;
pub use query::{QueryResponse, SnapshotQuery, SqlQuery};
pub use session::TimelineSession;
pub use sqlite::SqliteSnapshotStore;
pub use timeline::{TimelineCursor, TimelinePage, TimelineRequest, TimelineRow};
