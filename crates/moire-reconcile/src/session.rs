//! Timeline state for the currently selected entity.
//!
//! Fetches run outside the session; each one carries a [`LoadTicket`]
//! stamped with the selection generation it was issued for. Responses for
//! an older generation are dropped, and at most one "load older" is in
//! flight per selection.

use serde::Serialize;
use tracing::debug;

use crate::error::QueryError;
use crate::timeline::{TimelineCursor, TimelinePage, TimelineRequest, TimelineRow};

/// Permission to apply one fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    generation: u64,
    pub request: TimelineRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The selection changed after the ticket was issued.
    Stale,
}

#[derive(Debug, Default, Serialize)]
pub struct TimelineSession {
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    base: Option<TimelineRequest>,
    rows: Vec<TimelineRow>,
    next_cursor: Option<TimelineCursor>,
    loading: bool,
    error: Option<String>,
}

impl TimelineSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects an entity, dropping all state from the previous selection.
    /// The returned ticket loads the first page.
    pub fn select(&mut self, request: TimelineRequest) -> LoadTicket {
        self.generation += 1;
        let request = TimelineRequest {
            cursor: None,
            ..request
        };
        debug!(
            generation = self.generation,
            entity_id = %request.entity_id,
            proc_key = %request.proc_key,
            "timeline selection changed"
        );
        self.base = Some(request.clone());
        self.rows.clear();
        self.next_cursor = None;
        self.error = None;
        self.loading = true;
        LoadTicket {
            generation: self.generation,
            request,
        }
    }

    /// Clears the selection; outstanding tickets become stale.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.base = None;
        self.rows.clear();
        self.next_cursor = None;
        self.error = None;
        self.loading = false;
    }

    /// Ticket for the next older page, or `None` while a load is in flight,
    /// when nothing is selected, or when the timeline has ended.
    pub fn begin_load_older(&mut self) -> Option<LoadTicket> {
        if self.loading {
            return None;
        }
        let base = self.base.as_ref()?;
        let cursor = self.next_cursor.clone()?;
        self.loading = true;
        Some(LoadTicket {
            generation: self.generation,
            request: base.after(cursor),
        })
    }

    /// Applies a fetch result. A failure keeps the rows already loaded and
    /// the cursor, so the same "load older" can be retried.
    pub fn apply(
        &mut self,
        ticket: LoadTicket,
        result: Result<TimelinePage, QueryError>,
    ) -> ApplyOutcome {
        if ticket.generation != self.generation {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                entity_id = %ticket.request.entity_id,
                "dropping stale timeline response"
            );
            return ApplyOutcome::Stale;
        }
        self.loading = false;
        match result {
            Ok(page) => {
                let first_page = ticket.request.cursor.is_none();
                if first_page {
                    self.rows.clear();
                }
                for row in page.rows {
                    let seen = self
                        .rows
                        .iter()
                        .any(|r| r.event.ts_ns == row.event.ts_ns && r.event.id == row.event.id);
                    if !seen {
                        self.rows.push(row);
                    }
                }
                self.next_cursor = page.next_cursor;
                self.error = None;
            }
            Err(err) => {
                tracing::warn!(entity_id = %ticket.request.entity_id, %err, "timeline page failed");
                self.error = Some(err.to_string());
            }
        }
        ApplyOutcome::Applied
    }

    pub fn rows(&self) -> &[TimelineRow] {
        &self.rows
    }

    pub fn next_cursor(&self) -> Option<&TimelineCursor> {
        self.next_cursor.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True once a page came back short.
    pub fn is_exhausted(&self) -> bool {
        self.base.is_some() && !self.loading && self.error.is_none() && self.next_cursor.is_none()
    }
}
