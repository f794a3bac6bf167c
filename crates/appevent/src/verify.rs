//! Validation of events, watchers, processor configs and user info.
//!
//! Event-level problems (domain, name, parameter count) reject the write.
//! Problems with a single parameter only drop or trim that parameter; the
//! first such problem is reported back as a warning code.

use std::sync::LazyLock;

use appevent_cache::MAX_CUSTOM_PARAMS;
use appevent_types::{ErrorCode, EventParam, EventRecord, Filter, ParamValue, ReportConfig, TriggerCondition};
use regex::Regex;

use crate::error::AppEventError;

pub const MAX_DOMAIN_LEN: usize = 16;
pub const MAX_EVENT_NAME_LEN: usize = 48;
pub const MAX_PARAM_NAME_LEN: usize = 32;
pub const MAX_PARAM_NUM: usize = 32;
pub const MAX_STRING_LEN: usize = 8 * 1024;
pub const MAX_ARRAY_LEN: usize = 100;
pub const MAX_WATCHER_NAME_LEN: usize = 32;
pub const MAX_USER_INFO_NAME_LEN: usize = 256;
pub const MAX_USER_ID_VALUE_LEN: usize = 256;
pub const MAX_USER_PROPERTY_VALUE_LEN: usize = 1024;
pub const MAX_PROCESSOR_NAME_LEN: usize = 256;
pub const MAX_BATCH_REPORT: i32 = 1000;

/// Event names carrying this prefix are checked without it.
pub const RESERVED_NAME_PREFIX: &str = "hiappevent.";

static LOWER_SNAKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*[a-z0-9]$").expect("lower snake pattern is valid")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[$a-zA-Z]([a-zA-Z0-9_]*[a-zA-Z0-9])?$").expect("identifier pattern is valid")
});

static PROPERTY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_$][a-zA-Z0-9_$]*$").expect("property name pattern is valid")
});

fn within(value: &str, max: usize) -> bool {
    !value.is_empty() && value.len() <= max
}

pub fn is_valid_domain(domain: &str) -> bool {
    within(domain, MAX_DOMAIN_LEN)
        && (domain == appevent_types::DOMAIN_OS || LOWER_SNAKE.is_match(domain))
}

pub fn is_valid_event_name(name: &str) -> bool {
    match name.strip_prefix(RESERVED_NAME_PREFIX) {
        Some(rest) => {
            within(rest, MAX_EVENT_NAME_LEN - RESERVED_NAME_PREFIX.len()) && IDENTIFIER.is_match(rest)
        }
        None => within(name, MAX_EVENT_NAME_LEN) && IDENTIFIER.is_match(name),
    }
}

pub fn is_valid_param_name(name: &str) -> bool {
    within(name, MAX_PARAM_NAME_LEN) && IDENTIFIER.is_match(name)
}

pub fn is_valid_watcher_name(name: &str) -> bool {
    within(name, MAX_WATCHER_NAME_LEN) && LOWER_SNAKE.is_match(name)
}

pub fn is_valid_user_info_name(name: &str) -> bool {
    within(name, MAX_USER_INFO_NAME_LEN) && PROPERTY_NAME.is_match(name)
}

pub fn is_valid_user_id_value(value: &str) -> bool {
    within(value, MAX_USER_ID_VALUE_LEN)
}

pub fn is_valid_user_property_value(value: &str) -> bool {
    within(value, MAX_USER_PROPERTY_VALUE_LEN)
}

pub fn is_valid_processor_name(name: &str) -> bool {
    within(name, MAX_PROCESSOR_NAME_LEN) && PROPERTY_NAME.is_match(name)
}

/// Checks one parameter, trimming over-long arrays in place.
///
/// `Err` means the parameter must be dropped; `Ok(Some(code))` means it was
/// kept but changed.
fn check_param(param: &mut EventParam) -> Result<Option<ErrorCode>, ErrorCode> {
    if !is_valid_param_name(&param.name) {
        return Err(ErrorCode::InvalidParamName);
    }
    match &param.value {
        ParamValue::String(s) if s.len() > MAX_STRING_LEN => return Err(ErrorCode::InvalidStrLen),
        ParamValue::StringArray(v) if v.iter().any(|s| s.len() > MAX_STRING_LEN) => {
            return Err(ErrorCode::InvalidStrLen)
        }
        // JSON has no NaN or infinity.
        ParamValue::Double(d) if !d.is_finite() => return Err(ErrorCode::InvalidParam),
        ParamValue::DoubleArray(v) if v.iter().any(|d| !d.is_finite()) => {
            return Err(ErrorCode::InvalidParam)
        }
        _ => {}
    }
    if param.value.truncate_array(MAX_ARRAY_LEN) {
        return Ok(Some(ErrorCode::InvalidArrLen));
    }
    Ok(None)
}

/// Applies [`check_param`] to every parameter, dropping the rejected ones.
/// Returns the first problem found.
fn check_params(params: &mut Vec<EventParam>) -> Option<ErrorCode> {
    let mut first = None;
    params.retain_mut(|param| match check_param(param) {
        Ok(warning) => {
            if let Some(code) = warning {
                tracing::warn!(param = %param.name, "array parameter truncated to {MAX_ARRAY_LEN} elements");
                first.get_or_insert(code);
            }
            true
        }
        Err(code) => {
            tracing::warn!(param = %param.name, code = code.as_i32(), "parameter discarded");
            first.get_or_insert(code);
            false
        }
    });
    first
}

/// Validates an event before it is written.
///
/// Returns the first per-parameter warning, if any.
pub fn verify_event(event: &mut EventRecord) -> Result<Option<ErrorCode>, AppEventError> {
    if !is_valid_domain(&event.domain) {
        return Err(AppEventError::InvalidDomain(event.domain.clone()));
    }
    if !is_valid_event_name(&event.name) {
        return Err(AppEventError::InvalidName(event.name.clone()));
    }
    if event.params.len() > MAX_PARAM_NUM {
        return Err(AppEventError::TooManyParams(event.params.len()));
    }
    Ok(check_params(&mut event.params))
}

/// Validates parameters set out-of-band for a domain or a single event name.
pub fn verify_custom_params(
    domain: &str,
    name: &str,
    params: &mut Vec<EventParam>,
) -> Result<Option<ErrorCode>, AppEventError> {
    if !is_valid_domain(domain) {
        return Err(AppEventError::InvalidDomain(domain.to_string()));
    }
    if !name.is_empty() && !is_valid_event_name(name) {
        return Err(AppEventError::InvalidName(name.to_string()));
    }
    if params.len() > MAX_CUSTOM_PARAMS {
        return Err(AppEventError::TooManyCustomParams(params.len()));
    }
    Ok(check_params(params))
}

/// Validates a watcher registration.
pub fn verify_watcher(
    name: &str,
    filters: &[Filter],
    trigger: &TriggerCondition,
) -> Result<(), AppEventError> {
    if !is_valid_watcher_name(name) {
        return Err(AppEventError::InvalidWatcherName(name.to_string()));
    }
    if let Some(bad) = filters.iter().find(|f| !is_valid_domain(&f.domain)) {
        return Err(AppEventError::InvalidFilterDomain(bad.domain.clone()));
    }
    if trigger.row < 0 {
        return Err(AppEventError::InvalidTriggerRow(trigger.row));
    }
    if trigger.size < 0 {
        return Err(AppEventError::InvalidTriggerSize(trigger.size));
    }
    if trigger.timeout < 0 {
        return Err(AppEventError::InvalidTriggerTimeout(trigger.timeout));
    }
    Ok(())
}

/// Validates a processor configuration.
pub fn verify_report_config(config: &ReportConfig) -> Result<(), AppEventError> {
    let invalid = |what: &str| Err(AppEventError::InvalidArgument(what.to_string()));
    if !is_valid_processor_name(&config.name) {
        return invalid("processor name");
    }
    if config.route_info.len() > MAX_STRING_LEN {
        return invalid("route info");
    }
    if config.app_id.len() > MAX_STRING_LEN {
        return invalid("app id");
    }
    if !(0..=MAX_BATCH_REPORT).contains(&config.trigger_cond.row) {
        return invalid("batch report row");
    }
    if config.trigger_cond.timeout < 0 {
        return invalid("period report timeout");
    }
    if !config.user_id_names.iter().all(|n| is_valid_user_info_name(n)) {
        return invalid("user id name");
    }
    if !config
        .user_property_names
        .iter()
        .all(|n| is_valid_user_info_name(n))
    {
        return invalid("user property name");
    }
    let bad_event_config = config.event_configs.iter().any(|c| {
        (!c.domain.is_empty() && !is_valid_domain(&c.domain))
            || (!c.name.is_empty() && !is_valid_event_name(&c.name))
    });
    if bad_event_config {
        return invalid("event config");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use appevent_types::EventType;

    #[test]
    fn domains_follow_lower_snake_rule() {
        assert!(is_valid_domain("test_domain"));
        assert!(is_valid_domain("OS"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("Test"));
        assert!(!is_valid_domain("1abc"));
        assert!(!is_valid_domain("abc_"));
        assert!(!is_valid_domain("a23456789012345678"));
    }

    #[test]
    fn event_names_allow_reserved_prefix() {
        assert!(is_valid_event_name("click"));
        assert!(is_valid_event_name("$start"));
        assert!(is_valid_event_name("a"));
        assert!(!is_valid_event_name("end_"));
        assert!(!is_valid_event_name(&"a".repeat(49)));
        assert!(is_valid_event_name("hiappevent.launch"));
        assert!(!is_valid_event_name("hiappevent."));
    }

    #[test]
    fn non_finite_doubles_are_dropped() {
        let mut event = EventRecord::new("d1", "n1", EventType::Behavior)
            .with_param("ok", 1.5)
            .with_param("nan", f64::NAN)
            .with_param("inf", vec![1.0, f64::INFINITY]);
        let warning = verify_event(&mut event).expect("event kept");
        assert_eq!(warning, Some(ErrorCode::InvalidParam));
        assert!(event.param("ok").is_some());
        assert!(event.param("nan").is_none());
        assert!(event.param("inf").is_none());
    }

    #[test]
    fn bad_parameters_are_dropped_and_arrays_trimmed() {
        let mut event = EventRecord::new("d1", "n1", EventType::Behavior)
            .with_param("ok", 1)
            .with_param("bad-name", 2)
            .with_param("big", "x".repeat(MAX_STRING_LEN + 1))
            .with_param("list", vec![1i64; 150]);

        let warning = verify_event(&mut event).expect("event stays valid");
        assert_eq!(warning, Some(ErrorCode::InvalidParamName));

        let names: Vec<&str> = event.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["ok", "list"]);
        assert_eq!(event.param("list").and_then(ParamValue::array_len), Some(MAX_ARRAY_LEN));
    }

    #[test]
    fn too_many_params_reject_the_event() {
        let mut event = EventRecord::new("d1", "n1", EventType::Behavior);
        for i in 0..=MAX_PARAM_NUM {
            event.add_param(format!("p{i}"), 1);
        }
        let err = verify_event(&mut event).expect_err("33 params must fail");
        assert_eq!(err.code(), ErrorCode::InvalidParamNum);
    }

    #[test]
    fn watcher_checks_name_filters_and_trigger() {
        let ok = TriggerCondition::rows(1);
        assert!(verify_watcher("w1", &[Filter::domain("test_domain")], &ok).is_ok());
        assert_eq!(
            verify_watcher("W1", &[], &ok).map_err(|e| e.code()),
            Err(ErrorCode::InvalidWatcherName)
        );
        assert_eq!(
            verify_watcher("w1", &[Filter::domain("Bad")], &ok).map_err(|e| e.code()),
            Err(ErrorCode::InvalidFilterDomain)
        );
        let bad = TriggerCondition {
            timeout: -1,
            ..TriggerCondition::default()
        };
        assert_eq!(
            verify_watcher("w1", &[], &bad).map_err(|e| e.code()),
            Err(ErrorCode::InvalidCondTimeout)
        );
    }

    #[test]
    fn report_config_limits() {
        let mut config = ReportConfig::new("analytics_processor");
        assert!(verify_report_config(&config).is_ok());

        config.trigger_cond.row = MAX_BATCH_REPORT + 1;
        assert!(verify_report_config(&config).is_err());

        config.trigger_cond.row = 10;
        config.user_id_names.insert("bad name".into());
        assert!(verify_report_config(&config).is_err());
    }

    #[test]
    fn user_info_rules() {
        assert!(is_valid_user_info_name("_uid$1"));
        assert!(!is_valid_user_info_name("1uid"));
        assert!(is_valid_user_id_value(&"v".repeat(MAX_USER_ID_VALUE_LEN)));
        assert!(!is_valid_user_id_value(&"v".repeat(MAX_USER_ID_VALUE_LEN + 1)));
        assert!(!is_valid_user_property_value(""));
    }
}
