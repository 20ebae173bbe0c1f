//! Sorting and filtering of resolved duplex rows.

use std::cmp::Ordering;
use std::str::FromStr;

use super::{DuplexConnection, Health};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Health,
    Label,
    PendingTotal,
    LastRecvAge,
    LastSentAge,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "health" | "severity" => Ok(SortKey::Health),
            "label" | "name" => Ok(SortKey::Label),
            "pending" | "pending_total" => Ok(SortKey::PendingTotal),
            "recv" | "last_recv" | "last_recv_age" => Ok(SortKey::LastRecvAge),
            "sent" | "last_sent" | "last_sent_age" => Ok(SortKey::LastSentAge),
            other => Err(format!(
                "unknown sort key {other:?} (expected health, label, pending, last_recv, last_sent)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeverityFilter {
    #[default]
    All,
    WarningPlus,
    Critical,
}

impl SeverityFilter {
    pub fn admits(self, health: Health) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::WarningPlus => health >= Health::Warning,
            SeverityFilter::Critical => health == Health::Critical,
        }
    }
}

impl FromStr for SeverityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all" => Ok(SeverityFilter::All),
            "warning" | "warning_plus" | "warning+" => Ok(SeverityFilter::WarningPlus),
            "critical" => Ok(SeverityFilter::Critical),
            other => Err(format!(
                "unknown severity filter {other:?} (expected all, warning_plus, critical)"
            )),
        }
    }
}

/// How a table of duplex rows is presented.
#[derive(Debug, Clone, Default)]
pub struct ConnectionView {
    pub sort: SortKey,
    pub direction: SortDirection,
    pub severity: SeverityFilter,
    /// Keep only rows touching this process (name or proc key).
    pub process: Option<String>,
}

/// Sorts, then filters. Rows are never re-aggregated here, so filtering
/// cannot change any row's totals or health.
pub fn apply_view(mut rows: Vec<DuplexConnection>, view: &ConnectionView) -> Vec<DuplexConnection> {
    rows.sort_by(|a, b| {
        let primary = compare_by(view.sort, a, b);
        let primary = match view.direction {
            SortDirection::Ascending => primary,
            SortDirection::Descending => primary.reverse(),
        };
        primary.then_with(|| a.key.cmp(&b.key))
    });

    rows.retain(|row| view.severity.admits(row.health));
    if let Some(process) = view.process.as_deref().filter(|p| !p.is_empty()) {
        rows.retain(|row| row.involves_process(process));
    }
    rows
}

fn compare_by(key: SortKey, a: &DuplexConnection, b: &DuplexConnection) -> Ordering {
    match key {
        SortKey::Health => a.health.rank().cmp(&b.health.rank()),
        SortKey::Label => a.label.cmp(&b.label),
        SortKey::PendingTotal => a.pending_total.cmp(&b.pending_total),
        SortKey::LastRecvAge => a.last_recv_age_ns.cmp(&b.last_recv_age_ns),
        SortKey::LastSentAge => a.last_sent_age_ns.cmp(&b.last_sent_age_ns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, health: Health, pending_total: u64, recv: Option<i64>) -> DuplexConnection {
        let (a, b) = key.split_once("<->").unwrap();
        DuplexConnection {
            key: key.to_string(),
            label: format!("{a} <-> {b}"),
            endpoint_a: a.to_string(),
            endpoint_b: b.to_string(),
            link: String::new(),
            legs: Vec::new(),
            pending_requests: Some(pending_total),
            pending_responses: None,
            pending_total,
            last_recv_age_ns: recv,
            last_sent_age_ns: None,
            health,
        }
    }

    fn keys(rows: &[DuplexConnection]) -> Vec<&str> {
        rows.iter().map(|r| r.key.as_str()).collect()
    }

    fn sample() -> Vec<DuplexConnection> {
        vec![
            row("a<->b", Health::Warning, 12, Some(5)),
            row("c<->d", Health::Critical, 30, None),
            row("e<->f", Health::Healthy, 0, Some(90)),
            row("b<->z", Health::Warning, 11, Some(1)),
        ]
    }

    #[test]
    fn health_descending_breaks_ties_on_key() {
        let rows = apply_view(sample(), &ConnectionView::default());
        assert_eq!(keys(&rows), ["c<->d", "a<->b", "b<->z", "e<->f"]);
    }

    #[test]
    fn ascending_label_and_age() {
        let view = ConnectionView {
            sort: SortKey::Label,
            direction: SortDirection::Ascending,
            ..ConnectionView::default()
        };
        assert_eq!(keys(&apply_view(sample(), &view)), ["a<->b", "b<->z", "c<->d", "e<->f"]);

        let view = ConnectionView {
            sort: SortKey::LastRecvAge,
            ..ConnectionView::default()
        };
        assert_eq!(keys(&apply_view(sample(), &view)), ["e<->f", "a<->b", "b<->z", "c<->d"]);
    }

    #[test]
    fn filters_apply_after_sorting_without_touching_rows() {
        let view = ConnectionView {
            sort: SortKey::PendingTotal,
            severity: SeverityFilter::WarningPlus,
            ..ConnectionView::default()
        };
        let rows = apply_view(sample(), &view);
        assert_eq!(keys(&rows), ["c<->d", "a<->b", "b<->z"]);
        assert_eq!(rows[0].pending_total, 30);

        let view = ConnectionView {
            severity: SeverityFilter::Critical,
            ..ConnectionView::default()
        };
        assert_eq!(keys(&apply_view(sample(), &view)), ["c<->d"]);
    }

    #[test]
    fn process_filter_matches_either_endpoint() {
        let view = ConnectionView {
            process: Some("b".into()),
            ..ConnectionView::default()
        };
        assert_eq!(keys(&apply_view(sample(), &view)), ["a<->b", "b<->z"]);
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("pending-total".parse::<SortKey>(), Ok(SortKey::PendingTotal));
        assert_eq!("warning+".parse::<SeverityFilter>(), Ok(SeverityFilter::WarningPlus));
        assert!("bogus".parse::<SortKey>().is_err());
    }
}
