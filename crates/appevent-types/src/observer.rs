//! Observer interest and trigger configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::event::{EventRecord, EventType, DOMAIN_OS};

/// Selects events by domain, name set and type mask.
///
/// An empty domain matches every domain, an empty name set matches every name
/// and a zero type mask matches every type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub names: BTreeSet<String>,
    /// Bitmask of `1 << EventType` values.
    #[serde(default)]
    pub types: u32,
}

impl Filter {
    /// A filter for every event in `domain`.
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Restricts the filter to the given event names.
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restricts the filter to the given event types.
    pub fn with_types(mut self, types: &[EventType]) -> Self {
        for t in types {
            self.types |= t.mask_bit();
        }
        self
    }

    /// Returns `true` if the event passes this filter.
    pub fn matches(&self, event: &EventRecord) -> bool {
        if !self.domain.is_empty() && self.domain != event.domain {
            return false;
        }
        if !self.names.is_empty() && !self.names.contains(&event.name) {
            return false;
        }
        if self.types != 0 && self.types & event.event_type.mask_bit() == 0 {
            return false;
        }
        true
    }

    /// Whether this filter subscribes to operating-system events.
    pub fn is_os(&self) -> bool {
        self.domain == DOMAIN_OS
    }

    /// Type bits of OS events this filter wants, 0 for non-OS filters.
    pub fn os_events_mask(&self) -> u32 {
        match (self.is_os(), self.types) {
            (false, _) => 0,
            (true, 0) => ALL_TYPES_MASK,
            (true, types) => types,
        }
    }
}

const ALL_TYPES_MASK: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4);

/// Returns `true` if `filters` is empty or any filter accepts the event.
pub fn matches_any(filters: &[Filter], event: &EventRecord) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(event))
}

/// When an observer flushes its accumulated events.
///
/// Zero values and `false` flags disable the corresponding trigger. The same
/// struct doubles as the accumulated state reported to `on_trigger`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerCondition {
    #[serde(default)]
    pub row: i32,
    /// Accumulated serialised size in bytes.
    #[serde(default)]
    pub size: i32,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub on_startup: bool,
    #[serde(default)]
    pub on_background: bool,
}

impl TriggerCondition {
    /// Row-count trigger only.
    pub fn rows(row: i32) -> Self {
        Self {
            row,
            ..Self::default()
        }
    }
}

/// Per-event reporting rule for processors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_real_time: bool,
}

impl EventConfig {
    pub fn new(domain: impl Into<String>, name: impl Into<String>, is_real_time: bool) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            is_real_time,
        }
    }

    /// A config with neither domain nor name selects nothing.
    pub fn matches(&self, event: &EventRecord) -> bool {
        if self.domain.is_empty() && self.name.is_empty() {
            return false;
        }
        if !self.domain.is_empty() && self.domain != event.domain {
            return false;
        }
        if !self.name.is_empty() && self.name != event.name {
            return false;
        }
        true
    }

    pub fn is_real_time_event(&self, event: &EventRecord) -> bool {
        self.is_real_time && self.matches(event)
    }

    /// Filter equivalent of this config, or `None` if it selects nothing.
    pub fn to_filter(&self) -> Option<Filter> {
        if self.domain.is_empty() && self.name.is_empty() {
            return None;
        }
        let mut filter = Filter::domain(self.domain.clone());
        if !self.name.is_empty() {
            filter.names.insert(self.name.clone());
        }
        Some(filter)
    }
}

/// Full configuration of a reporting processor.
///
/// Serialisation is deterministic (ordered sets, declared field order) so the
/// serialised form can serve as the processor's identity when `config_id` is 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub name: String,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub route_info: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub trigger_cond: TriggerCondition,
    #[serde(default)]
    pub user_id_names: BTreeSet<String>,
    #[serde(default)]
    pub user_property_names: BTreeSet<String>,
    #[serde(default)]
    pub event_configs: Vec<EventConfig>,
    #[serde(default)]
    pub config_id: i32,
    #[serde(default)]
    pub custom_configs: std::collections::BTreeMap<String, String>,
}

impl ReportConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Filters derived from `event_configs`.
    pub fn filters(&self) -> Vec<Filter> {
        self.event_configs.iter().filter_map(EventConfig::to_filter).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(domain: &str, name: &str, t: EventType) -> EventRecord {
        EventRecord::new(domain, name, t)
    }

    #[test]
    fn filter_matches_domain_names_and_types() {
        let filter = Filter::domain("test_domain")
            .with_names(["n1", "n2"])
            .with_types(&[EventType::Fault, EventType::Statistic]);

        assert!(filter.matches(&event("test_domain", "n1", EventType::Statistic)));
        assert!(!filter.matches(&event("test_domain", "n3", EventType::Statistic)));
        assert!(!filter.matches(&event("test_domain", "n1", EventType::Behavior)));
        assert!(!filter.matches(&event("other", "n1", EventType::Fault)));
    }

    #[test]
    fn empty_filter_fields_match_anything() {
        let filter = Filter::default();
        assert!(filter.matches(&event("any_domain", "any", EventType::Security)));
    }

    #[test]
    fn event_config_without_domain_or_name_selects_nothing() {
        let cfg = EventConfig::default();
        assert!(!cfg.matches(&event("d", "n", EventType::Fault)));
        assert!(cfg.to_filter().is_none());

        let cfg = EventConfig::new("d", "", true);
        assert!(cfg.is_real_time_event(&event("d", "n", EventType::Fault)));
        assert_eq!(cfg.to_filter(), Some(Filter::domain("d")));
    }

    #[test]
    fn report_config_serialisation_is_stable() {
        let mut a = ReportConfig::new("proc");
        a.user_id_names.insert("b".into());
        a.user_id_names.insert("a".into());
        let mut b = ReportConfig::new("proc");
        b.user_id_names.insert("a".into());
        b.user_id_names.insert("b".into());

        let sa = serde_json::to_string(&a).expect("serialize a");
        let sb = serde_json::to_string(&b).expect("serialize b");
        assert_eq!(sa, sb);
    }

    #[test]
    fn os_mask_covers_all_types_when_unrestricted() {
        assert_eq!(Filter::domain("OS").os_events_mask(), 0b1_1110);
        assert_eq!(
            Filter::domain("OS").with_types(&[EventType::Fault]).os_events_mask(),
            0b10
        );
        assert_eq!(Filter::domain("app").os_events_mask(), 0);
        assert!(matches_any(&[], &event("x", "y", EventType::Fault)));
    }

    #[test]
    fn filter_json_round_trips_with_missing_fields() {
        let parsed: Filter = serde_json::from_str(r#"{"domain":"OS"}"#).expect("parse filter");
        assert!(parsed.is_os());
        assert!(parsed.names.is_empty());
        assert_eq!(parsed.types, 0);
    }
}
