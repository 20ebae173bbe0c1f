use std::sync::Arc;

use facet::Facet;
use figue as args;
use moire_reconcile::duplex::DuplexOptions;
use moire_reconcile::kinds::{KindRegistry, SummaryContext, describe_graph};
use moire_reconcile::timeline::{TimelineRow, entity_origin_ns};
use moire_reconcile::{
    ConnectionView, HttpSnapshotQuery, InspectConfig, ProcessPalette, SeverityFilter,
    SnapshotInspector, SnapshotQuery, SortDirection, SortKey, SqliteSnapshotStore, TimelineCursor,
};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::named, default)]
    url: Option<String>,
    #[facet(args::named, default)]
    db: Option<String>,
    #[facet(args::named)]
    snapshot: i64,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    Graph,
    Connections {
        #[facet(args::named, default)]
        sort: Option<String>,
        #[facet(args::named, default)]
        desc: bool,
        #[facet(args::named, default)]
        severity: Option<String>,
        #[facet(args::named, default)]
        process: Option<String>,
        #[facet(args::named, default)]
        include_closed: bool,
    },
    Timeline {
        #[facet(args::named)]
        proc_key: String,
        #[facet(args::named)]
        entity: String,
        #[facet(args::named, default)]
        limit: Option<usize>,
        #[facet(args::named, default)]
        cursor_ts: Option<i64>,
        #[facet(args::named, default)]
        cursor_id: Option<String>,
        #[facet(args::named, default)]
        all: bool,
    },
    Stuck {
        #[facet(args::named, default)]
        min_secs: Option<f64>,
    },
    Processes,
    Events {
        #[facet(args::named, default)]
        limit: Option<usize>,
    },
}

const DEFAULT_STUCK_SECS: f64 = 5.0;
const DEFAULT_EVENT_LIMIT: usize = 50;

type Inspector = SnapshotInspector<Arc<dyn SnapshotQuery>>;

#[derive(Serialize)]
struct TimelineOutput {
    rows: Vec<TimelineRow>,
    next_cursor: Option<TimelineCursor>,
    origin_ns: Option<i64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = parse_cli()?;
    let mut config = InspectConfig::from_env();
    if let Some(url) = cli.url {
        config.base_url = url;
    }
    if let Some(db) = cli.db {
        config.db_path = Some(db.into());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?
        .block_on(async {
            let inspector = open_inspector(&config, cli.snapshot)?;
            run_command(&inspector, &config, cli.command).await
        })
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("moire-inspect")
                .description("Reconciled views of one moire snapshot")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn open_inspector(config: &InspectConfig, snapshot_id: i64) -> Result<Inspector, String> {
    let query: Arc<dyn SnapshotQuery> = match &config.db_path {
        Some(path) => {
            info!(path = %path.display(), snapshot_id, "reading local snapshot database");
            let store = SqliteSnapshotStore::open(path)
                .map_err(|e| format!("open {}: {e}", path.display()))?;
            Arc::new(store)
        }
        None => {
            info!(url = %config.base_url, snapshot_id, "querying snapshot server");
            Arc::new(HttpSnapshotQuery::new(config.base_url.clone()))
        }
    };
    let mut inspector = SnapshotInspector::new(query, snapshot_id);
    inspector.thresholds = config.thresholds;
    inspector.timeline = config.timeline;
    Ok(inspector)
}

async fn run_command(
    inspector: &Inspector,
    config: &InspectConfig,
    command: Command,
) -> Result<(), String> {
    match command {
        Command::Graph => {
            let (graph, captured_at_ns) =
                tokio::try_join!(inspector.load_graph(), inspector.captured_at_ns())
                    .map_err(|e| e.to_string())?;
            let cx = SummaryContext {
                captured_at_ns,
                thresholds: config.thresholds,
            };
            let mut palette = ProcessPalette::default();
            let nodes = describe_graph(&graph, &KindRegistry::default(), &mut palette, &cx);
            print_json(&serde_json::json!({
                "nodes": nodes,
                "edges": graph.edges,
                "ghost_count": graph.ghost_nodes.len(),
            }))
        }
        Command::Connections {
            sort,
            desc,
            severity,
            process,
            include_closed,
        } => {
            let view = connection_view(sort, desc, severity, process)?;
            let mut inspector = inspector.clone();
            inspector.duplex = DuplexOptions { include_closed };
            let rows = inspector
                .load_connections(&view)
                .await
                .map_err(|e| e.to_string())?;
            print_json(&rows)
        }
        Command::Timeline {
            proc_key,
            entity,
            limit,
            cursor_ts,
            cursor_id,
            all,
        } => {
            let cursor = match (cursor_ts, cursor_id) {
                (Some(ts_ns), Some(id)) => Some(TimelineCursor { ts_ns, id }),
                (None, None) => None,
                _ => return Err("--cursor-ts and --cursor-id must be given together".to_string()),
            };
            let output = timeline(inspector, config, &proc_key, &entity, limit, cursor, all)
                .await
                .map_err(|e| e.to_string())?;
            print_json(&output)
        }
        Command::Stuck { min_secs } => {
            let stuck = inspector
                .stuck_requests(min_secs.unwrap_or(DEFAULT_STUCK_SECS))
                .await
                .map_err(|e| e.to_string())?;
            print_json(&stuck)
        }
        Command::Processes => {
            let processes = inspector.process_options().await.map_err(|e| e.to_string())?;
            print_json(&processes)
        }
        Command::Events { limit } => {
            let events = inspector
                .recent_events(limit.unwrap_or(DEFAULT_EVENT_LIMIT))
                .await
                .map_err(|e| e.to_string())?;
            print_json(&events)
        }
    }
}

fn connection_view(
    sort: Option<String>,
    desc: bool,
    severity: Option<String>,
    process: Option<String>,
) -> Result<ConnectionView, String> {
    let mut view = ConnectionView {
        process,
        ..ConnectionView::default()
    };
    if let Some(sort) = sort {
        view.sort = sort.parse::<SortKey>()?;
        view.direction = if desc {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        };
    }
    if let Some(severity) = severity {
        view.severity = severity.parse::<SeverityFilter>()?;
    }
    Ok(view)
}

async fn timeline(
    inspector: &Inspector,
    config: &InspectConfig,
    proc_key: &str,
    entity: &str,
    limit: Option<usize>,
    cursor: Option<TimelineCursor>,
    all: bool,
) -> Result<TimelineOutput, moire_reconcile::QueryError> {
    let mut request = inspector
        .timeline_request(proc_key, entity, limit, cursor)
        .await?;
    let mut rows = Vec::new();
    let next_cursor = loop {
        let page = inspector.fetch_timeline_page(&request).await?;
        debug!(rows = page.rows.len(), more = page.next_cursor.is_some(), "timeline page");
        rows.extend(page.rows);
        match page.next_cursor {
            Some(cursor) if all => request = request.after(cursor),
            other => break other,
        }
    };

    let nodes = inspector.nodes().await?;
    let node = nodes.iter().find(|node| node.id == entity);
    let origin_ns = entity_origin_ns(node, &rows, &config.timeline);
    Ok(TimelineOutput {
        rows,
        next_cursor,
        origin_ns,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let pretty = serde_json::to_string_pretty(value).map_err(|e| format!("encode output: {e}"))?;
    println!("{pretty}");
    Ok(())
}
