//! Topic name and filter validation, wildcard matching, client id validation
//!
//! Publish topics are concrete names and must not carry wildcards. Subscription
//! filters may use `+` for exactly one level and `#` for the remainder of the
//! topic, but only as whole levels and `#` only last.

use crate::error::MqttError;
use thiserror::Error;

/// Longest string the MQTT wire format can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Longest client identifier accepted before connecting
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Validation errors for topics and client identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("topic cannot be empty")]
    EmptyTopic,
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TopicTooLong,
    #[error("topic contains a NUL character")]
    NulCharacter,
    #[error("wildcard '{0}' not allowed in a topic name")]
    WildcardInName(char),
    #[error("'+' must occupy a whole level")]
    MisplacedSingleLevel,
    #[error("'#' must occupy the last level")]
    MisplacedMultiLevel,
    #[error("client id cannot be empty")]
    EmptyClientId,
    #[error("client id exceeds {MAX_CLIENT_ID_LEN} characters")]
    ClientIdTooLong,
    #[error("client id contains invalid character: '{0}'")]
    InvalidClientIdChar(char),
}

fn validate_common(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong);
    }
    if topic.contains('\0') {
        return Err(ValidationError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    validate_common(topic)?;
    if let Some(wildcard) = topic.chars().find(|c| *c == '+' || *c == '#') {
        return Err(ValidationError::WildcardInName(wildcard));
    }
    Ok(())
}

/// Validate a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::MisplacedSingleLevel);
        }
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(ValidationError::MisplacedMultiLevel);
        }
    }
    Ok(())
}

/// Check whether a concrete topic matches a subscription filter.
///
/// Topics starting with `$` are never matched by a filter whose first level is a
/// wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a client identifier: ASCII alphanumerics plus `.`, `_` and `-`
pub fn validate_client_id(client_id: &str) -> Result<(), ValidationError> {
    if client_id.is_empty() {
        return Err(ValidationError::EmptyClientId);
    }
    if client_id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::ClientIdTooLong);
    }
    for ch in client_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidClientIdChar(ch));
        }
    }
    Ok(())
}

/// Publish-side validation mapped onto the engine error type
pub(crate) fn check_topic_name(topic: &str) -> Result<(), MqttError> {
    validate_topic_name(topic).map_err(|e| MqttError::invalid_topic(topic, e.to_string()))
}

/// Subscribe-side validation mapped onto the engine error type
pub(crate) fn check_topic_filter(filter: &str) -> Result<(), MqttError> {
    validate_topic_filter(filter).map_err(|e| MqttError::invalid_topic(filter, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn concrete_topic_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
            prop_assert!(topic_matches(&topic, &topic), "{} should match itself", topic);
        }

        #[test]
        fn multi_level_wildcard_matches_everything(topic in "[a-z0-9]{1,8}(/[a-z0-9]{0,8}){0,5}") {
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn single_level_wildcard_replaces_any_level(
            levels in proptest::collection::vec("[a-z0-9]{1,6}", 1..6),
            index in 0usize..6
        ) {
            let index = index % levels.len();
            let topic = levels.join("/");
            let mut filter_levels = levels.clone();
            filter_levels[index] = "+".to_string();
            let filter = filter_levels.join("/");

            prop_assert!(validate_topic_filter(&filter).is_ok());
            prop_assert!(topic_matches(&filter, &topic), "{} should match {}", filter, topic);
        }

        #[test]
        fn names_with_wildcards_are_rejected(prefix in "[a-z]{0,5}", wildcard in "[+#]") {
            let topic = format!("{prefix}{wildcard}");
            prop_assert!(validate_topic_name(&topic).is_err());
        }

        #[test]
        fn valid_client_ids_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_client_id(&id).is_ok());
        }
    }

    #[test]
    fn test_filter_wildcard_placement() {
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("+/+/#").is_ok());

        assert_eq!(
            validate_topic_filter("a/b+"),
            Err(ValidationError::MisplacedSingleLevel)
        );
        assert_eq!(
            validate_topic_filter("a/#/c"),
            Err(ValidationError::MisplacedMultiLevel)
        );
        assert_eq!(
            validate_topic_filter("a#"),
            Err(ValidationError::MisplacedMultiLevel)
        );
        assert_eq!(validate_topic_filter(""), Err(ValidationError::EmptyTopic));
    }

    #[test]
    fn test_topic_name_rules() {
        assert!(validate_topic_name("sensors/kitchen/temp").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());
        assert_eq!(
            validate_topic_name("a/+"),
            Err(ValidationError::WildcardInName('+'))
        );
        assert_eq!(validate_topic_name("a\0b"), Err(ValidationError::NulCharacter));
        assert_eq!(
            validate_topic_name(&"x".repeat(MAX_TOPIC_LEN + 1)),
            Err(ValidationError::TopicTooLong)
        );
    }

    #[test]
    fn test_matching_examples() {
        assert!(topic_matches("sport/tennis/#", "sport/tennis"));
        assert!(topic_matches("sport/tennis/#", "sport/tennis/player1/ranking"));
        assert!(topic_matches("sport/+/player1", "sport/tennis/player1"));
        assert!(topic_matches("+/+", "/finance"));
        assert!(!topic_matches("sport/+", "sport/tennis/player1"));
        assert!(!topic_matches("sport/tennis", "sport/tennis/player1"));
        assert!(!topic_matches("a/b", "a"));
    }

    #[test]
    fn test_system_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(!topic_matches("+/uptime", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_client_id_validation() {
        assert!(validate_client_id("sensor-gw_01.eu").is_ok());
        assert_eq!(validate_client_id(""), Err(ValidationError::EmptyClientId));
        assert_eq!(
            validate_client_id("gw 1"),
            Err(ValidationError::InvalidClientIdChar(' '))
        );
        assert_eq!(
            validate_client_id(&"a".repeat(MAX_CLIENT_ID_LEN + 1)),
            Err(ValidationError::ClientIdTooLong)
        );
    }

    #[test]
    fn test_engine_error_mapping() {
        let error = check_topic_name("a/#").unwrap_err();
        assert!(matches!(error, MqttError::InvalidTopic { ref topic, .. } if topic == "a/#"));
        assert!(check_topic_filter("a/#").is_ok());
    }
}
