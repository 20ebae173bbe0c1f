//! Keyset-paginated event timeline for one entity.
//!
//! Rows are ordered by `(ts_ns DESC, id DESC)`. The cursor is the last row's
//! `(ts_ns, id)`; the next page holds rows strictly older under that same
//! ordering, so events sharing a timestamp are neither skipped nor repeated.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::debug;

use crate::attrs::keys;
use crate::model::{Node, TimelineEvent};
use crate::query::{SqlQuery, TIMELINE_AFTER_CURSOR_SQL, TIMELINE_SQL};

const DAY_NS: i64 = 24 * 60 * 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineConfig {
    pub page_size: usize,
    /// How far before the earliest event a creation timestamp may lie and
    /// still anchor the axis.
    pub origin_window_ns: i64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            origin_window_ns: 30 * DAY_NS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TimelineCursor {
    pub ts_ns: i64,
    pub id: String,
}

impl TimelineCursor {
    pub fn of(event: &TimelineEvent) -> Self {
        Self {
            ts_ns: event.ts_ns,
            id: event.id.clone(),
        }
    }

    /// True when `event` comes after this cursor in page order.
    pub fn precedes(&self, event: &TimelineEvent) -> bool {
        event.ts_ns < self.ts_ns || (event.ts_ns == self.ts_ns && event.id < self.id)
    }
}

/// How a row relates to the inspected entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relation {
    #[serde(rename = "self")]
    Itself,
    #[serde(rename = "parent")]
    Parent,
    #[serde(rename = "child")]
    Child,
}

pub fn relation_for(event: &TimelineEvent, target: &str) -> Relation {
    if event.entity_id == target {
        Relation::Itself
    } else if event.parent_entity_id.as_deref() == Some(target) {
        Relation::Parent
    } else {
        Relation::Child
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineRow {
    #[serde(flatten)]
    pub event: TimelineEvent,
    pub relation: Relation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePage {
    pub rows: Vec<TimelineRow>,
    /// Present iff the page came back full.
    pub next_cursor: Option<TimelineCursor>,
}

/// Everything one page fetch depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRequest {
    pub proc_key: String,
    pub entity_id: String,
    pub captured_at_ns: i64,
    pub limit: usize,
    pub cursor: Option<TimelineCursor>,
}

impl TimelineRequest {
    pub fn first_page(
        proc_key: impl Into<String>,
        entity_id: impl Into<String>,
        captured_at_ns: i64,
        limit: usize,
    ) -> Self {
        Self {
            proc_key: proc_key.into(),
            entity_id: entity_id.into(),
            captured_at_ns,
            limit,
            cursor: None,
        }
    }

    pub fn after(&self, cursor: TimelineCursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..self.clone()
        }
    }

    pub fn to_query(&self) -> SqlQuery {
        let base = match &self.cursor {
            Some(_) => SqlQuery::new(TIMELINE_AFTER_CURSOR_SQL),
            None => SqlQuery::new(TIMELINE_SQL),
        };
        let query = base
            .bind(self.proc_key.as_str())
            .bind(self.entity_id.as_str())
            .bind(self.captured_at_ns)
            .bind(self.limit as u64);
        match &self.cursor {
            Some(cursor) => query.bind(cursor.ts_ns).bind(cursor.id.as_str()),
            None => query,
        }
    }

    fn admits(&self, event: &TimelineEvent) -> bool {
        event.proc_key == self.proc_key
            && (event.entity_id == self.entity_id
                || event.parent_entity_id.as_deref() == Some(self.entity_id.as_str()))
            && event.ts_ns <= self.captured_at_ns
            && self
                .cursor
                .as_ref()
                .map_or(true, |cursor| cursor.precedes(event))
    }
}

fn page_order(a: &TimelineEvent, b: &TimelineEvent) -> Ordering {
    b.ts_ns.cmp(&a.ts_ns).then_with(|| b.id.cmp(&a.id))
}

/// Turns fetched rows into a page.
///
/// Rows outside the request's predicate are dropped, the rest are put in
/// page order with `(ts_ns, id)` duplicates removed and capped at `limit`.
pub fn assemble_page(request: &TimelineRequest, events: Vec<TimelineEvent>) -> TimelinePage {
    let fetched = events.len();
    let mut events: Vec<TimelineEvent> = events.into_iter().filter(|e| request.admits(e)).collect();
    events.sort_by(page_order);
    events.dedup_by(|a, b| a.ts_ns == b.ts_ns && a.id == b.id);
    events.truncate(request.limit);
    if events.len() != fetched {
        debug!(
            fetched,
            kept = events.len(),
            entity_id = %request.entity_id,
            "timeline rows filtered"
        );
    }

    let next_cursor = match events.last() {
        Some(last) if events.len() == request.limit => Some(TimelineCursor::of(last)),
        _ => None,
    };
    let rows = events
        .into_iter()
        .map(|event| TimelineRow {
            relation: relation_for(&event, &request.entity_id),
            event,
        })
        .collect();
    TimelinePage { rows, next_cursor }
}

/// Anchor for the relative time axis.
///
/// The entity's creation timestamp is used when it is not after the
/// earliest event and not more than `window_ns` before it; otherwise the
/// earliest event's own timestamp.
pub fn timeline_origin_ns(
    created_at_ns: Option<i64>,
    rows: &[TimelineRow],
    window_ns: i64,
) -> Option<i64> {
    let earliest = rows.iter().map(|row| row.event.ts_ns).min();
    match (created_at_ns, earliest) {
        (Some(created), Some(earliest))
            if created <= earliest && earliest.saturating_sub(created) <= window_ns =>
        {
            Some(created)
        }
        (Some(created), None) => Some(created),
        (_, earliest) => earliest,
    }
}

/// [`timeline_origin_ns`] reading the creation time from the entity's node.
pub fn entity_origin_ns(
    entity: Option<&Node>,
    rows: &[TimelineRow],
    config: &TimelineConfig,
) -> Option<i64> {
    let created = entity.and_then(|node| node.attrs.timestamp_ns(keys::CREATED_AT));
    timeline_origin_ns(created, rows, config.origin_window_ns)
}
