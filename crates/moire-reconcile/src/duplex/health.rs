//! Health severities, connection state, and classification thresholds.

use serde::Serialize;

use crate::attrs::{AttrBag, keys};

/// Severity, ordered `Healthy < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Closed,
    Unknown,
    /// Synthesized for a direction nobody reported.
    Missing,
}

impl ConnectionState {
    pub fn from_attrs(attrs: &AttrBag) -> Self {
        let Some(raw) = attrs.string(keys::CONNECTION_STATE) else {
            return ConnectionState::Unknown;
        };
        match raw.to_ascii_lowercase().as_str() {
            "open" | "connected" | "established" | "active" => ConnectionState::Open,
            "closed" | "disconnected" | "shutdown" | "closing" => ConnectionState::Closed,
            _ => ConnectionState::Unknown,
        }
    }
}

/// Leg classification cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub pending_warning: u64,
    pub pending_critical: u64,
    pub recv_age_warning_ns: i64,
    pub recv_age_critical_ns: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pending_warning: 10,
            pending_critical: 25,
            recv_age_warning_ns: 15 * 1_000_000_000,
            recv_age_critical_ns: 60 * 1_000_000_000,
        }
    }
}

impl HealthThresholds {
    /// Pending pressure decides first; receive staleness only counts when
    /// pending is below the warning cutoff.
    pub fn classify(
        &self,
        pending_requests: Option<u64>,
        pending_responses: Option<u64>,
        last_recv_age_ns: Option<i64>,
    ) -> Health {
        let pending = pending_requests
            .unwrap_or(0)
            .max(pending_responses.unwrap_or(0));
        if pending >= self.pending_critical {
            return Health::Critical;
        }
        if pending >= self.pending_warning {
            return Health::Warning;
        }
        match last_recv_age_ns {
            Some(age) if age >= self.recv_age_critical_ns => Health::Critical,
            Some(age) if age >= self.recv_age_warning_ns => Health::Warning,
            _ => Health::Healthy,
        }
    }
}
