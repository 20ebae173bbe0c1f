//! Inspector settings with environment overrides.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::duplex::HealthThresholds;
use crate::timeline::TimelineConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9130";

const SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct InspectConfig {
    /// Base URL of the `/api/sql` collaborator.
    pub base_url: String,
    /// Local snapshot database; when set it is queried instead of `base_url`.
    pub db_path: Option<PathBuf>,
    pub thresholds: HealthThresholds,
    pub timeline: TimelineConfig,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            db_path: None,
            thresholds: HealthThresholds::default(),
            timeline: TimelineConfig::default(),
        }
    }
}

impl InspectConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`; unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("MOIRE_URL").filter(|url| !url.trim().is_empty()) {
            config.base_url = url;
        }
        config.db_path = lookup("MOIRE_DB")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let t = &mut config.thresholds;
        override_with(&lookup, "MOIRE_PENDING_WARN", &mut t.pending_warning);
        override_with(&lookup, "MOIRE_PENDING_CRIT", &mut t.pending_critical);
        let mut recv_warn_secs = t.recv_age_warning_ns / SEC;
        let mut recv_crit_secs = t.recv_age_critical_ns / SEC;
        override_with(&lookup, "MOIRE_RECV_WARN_SECS", &mut recv_warn_secs);
        override_with(&lookup, "MOIRE_RECV_CRIT_SECS", &mut recv_crit_secs);
        t.recv_age_warning_ns = recv_warn_secs.saturating_mul(SEC);
        t.recv_age_critical_ns = recv_crit_secs.saturating_mul(SEC);

        override_with(&lookup, "MOIRE_TIMELINE_LIMIT", &mut config.timeline.page_size);
        if config.timeline.page_size == 0 {
            warn!("MOIRE_TIMELINE_LIMIT must be positive, using default");
            config.timeline.page_size = TimelineConfig::default().page_size;
        }
        config
    }
}

fn override_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = InspectConfig::from_lookup(lookup(&[]));
        assert_eq!(config, InspectConfig::default());
        assert_eq!(config.thresholds.pending_critical, 25);
        assert_eq!(config.timeline.page_size, 25);
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = InspectConfig::from_lookup(lookup(&[
            ("MOIRE_URL", "http://debug-box:9130"),
            ("MOIRE_DB", "/tmp/moire.sqlite"),
            ("MOIRE_PENDING_WARN", "5"),
            ("MOIRE_PENDING_CRIT", "many"),
            ("MOIRE_RECV_CRIT_SECS", "120"),
            ("MOIRE_TIMELINE_LIMIT", "0"),
        ]));
        assert_eq!(config.base_url, "http://debug-box:9130");
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/moire.sqlite")));
        assert_eq!(config.thresholds.pending_warning, 5);
        assert_eq!(config.thresholds.pending_critical, 25);
        assert_eq!(config.thresholds.recv_age_warning_ns, 15 * SEC);
        assert_eq!(config.thresholds.recv_age_critical_ns, 120 * SEC);
        assert_eq!(config.timeline.page_size, 25);
    }
}
