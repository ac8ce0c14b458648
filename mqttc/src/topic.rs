//! Topic name and topic filter rules (MQTT 3.1.1, section 4.7).

use crate::error::ProtocolError;

/// Topic level separator.
pub const LEVEL_SEP: char = '/';
/// Single-level wildcard.
pub const MATCH_ONE: &str = "+";
/// Multi-level wildcard.
pub const MATCH_ALL: &str = "#";

const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Check a topic name used for PUBLISH.
///
/// Non-empty, at most 65535 bytes, no NUL and no wildcard characters.
pub fn validate_topic(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty()
        || topic.len() > MAX_TOPIC_LEN
        || topic.contains(|c| c == '+' || c == '#' || c == '\0')
    {
        return Err(ProtocolError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Check a topic filter used for SUBSCRIBE / UNSUBSCRIBE.
///
/// `+` must occupy a whole level; `#` must occupy the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ProtocolError> {
    let invalid = || ProtocolError::InvalidTopicFilter(filter.to_string());

    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(invalid());
    }

    let mut levels = filter.split(LEVEL_SEP).peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            MATCH_ONE => {}
            MATCH_ALL if is_last => {}
            _ if level.contains(['+', '#']) => return Err(invalid()),
            _ => {}
        }
    }

    Ok(())
}

/// Whether `filter` matches `topic`.
///
/// Both arguments are assumed valid. Wildcards at the first level never
/// match topics starting with `$`.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEP);
    let mut topic_levels = topic.split(LEVEL_SEP);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "sport/#" also matches "sport"
            (Some(MATCH_ALL), _) => return true,
            (Some(MATCH_ONE), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
