//! MQTT topic validation and filter matching
//!
//! Topic names are what messages are published to; topic filters are what
//! sessions subscribe with and may carry the `+` and `#` wildcards.

use thiserror::Error;

/// Upper bound imposed by the MQTT length prefix
pub const MAX_TOPIC_LEN: usize = 65_535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Wildcard '{0}' is not allowed in a topic name")]
    WildcardInName(char),
    #[error("'+' must occupy an entire topic level")]
    MisplacedSingleLevelWildcard,
    #[error("'#' must be the last character and occupy an entire topic level")]
    MisplacedMultiLevelWildcard,
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if let Some(ch) = topic.chars().find(|c| *c == '+' || *c == '#') {
        return Err(TopicError::WildcardInName(ch));
    }
    Ok(())
}

/// Validate a topic filter used for subscribing
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(TopicError::MisplacedMultiLevelWildcard);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevelWildcard);
        }
    }
    Ok(())
}

/// Check whether a topic name matches a subscription filter
///
/// Topics starting with `$` are not matched by filters starting with a wildcard.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
