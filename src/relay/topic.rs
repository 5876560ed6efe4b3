//! MQTT topic names and filters
//!
//! Level rules come from `rumqttc`; this module adds the size and NUL limits
//! and the `$`-topic handling the relay needs.

use crate::error::RelayError;

/// Longest topic accepted, in bytes (MQTT string length limit)
const MAX_TOPIC_LEN: usize = 65_535;

/// Check a topic name used for publishing
pub fn validate_topic(topic: &str) -> Result<(), RelayError> {
    if topic.is_empty() {
        return Err(RelayError::InvalidTopic("topic must not be empty".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(RelayError::InvalidTopic("topic is too long".to_string()));
    }
    if topic.contains('\0') {
        return Err(RelayError::InvalidTopic("topic contains NUL".to_string()));
    }
    if !rumqttc::valid_topic(topic) {
        return Err(RelayError::InvalidTopic(format!(
            "'{}' contains wildcard characters",
            topic
        )));
    }
    Ok(())
}

/// Check a subscription filter
///
/// `#` must be the last level and occupy it alone; `+` must occupy a whole level.
pub fn validate_filter(filter: &str) -> Result<(), RelayError> {
    if filter.is_empty() {
        return Err(RelayError::InvalidFilter("filter must not be empty".to_string()));
    }
    if filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(RelayError::InvalidFilter(filter.chars().take(64).collect()));
    }
    if !rumqttc::valid_filter(filter) {
        return Err(RelayError::InvalidFilter(format!(
            "'{}': '#' must be the whole last level and '+' a whole level",
            filter
        )));
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`
///
/// Topics starting with `$` are not matched by a leading wildcard, but are
/// matched by filters naming their first level literally.
pub fn matches(filter: &str, topic: &str) -> bool {
    match topic.chars().next() {
        Some('$') if filter.starts_with(['+', '#']) => false,
        // rumqttc refuses every `$` topic and slices the first byte, so give
        // both sides a shared ASCII first level
        Some(first) if first == '$' || !first.is_ascii() => {
            rumqttc::matches(&format!("_/{}", topic), &format!("_/{}", filter))
        }
        _ => rumqttc::matches(topic, filter),
    }
}
