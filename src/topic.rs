//! Topic keys: `<prefix>/<user_id>/<event_id>`
//!
//! One key addresses one published event. `user_id` is opaque and must
//! not contain `/`; `event_id` is a decimal `u64` that only keeps keys
//! distinct, it carries no ordering meaning across publishers.

/// Default key-space prefix
pub const DEFAULT_PREFIX: &str = "events";

const SEPARATOR: char = '/';

/// Formats and parses topic keys under a fixed prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCodec {
    prefix: String,
}

impl Default for TopicCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl TopicCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix to watch for every topic of this codec (`<prefix>/`)
    pub fn watch_prefix(&self) -> String {
        format!("{}{}", self.prefix, SEPARATOR)
    }

    /// Whether `key` lives under this codec's prefix
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
    }

    pub fn format(&self, user_id: &str, event_id: u64) -> String {
        format_topic(&self.prefix, user_id, event_id)
    }

    pub fn parse(&self, key: &str) -> (String, u64) {
        parse_topic(key)
    }
}

/// A user id can be embedded in a topic key: non-empty, no `/`
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty() && !user_id.contains(SEPARATOR)
}

/// Build the key for one event
pub fn format_topic(prefix: &str, user_id: &str, event_id: u64) -> String {
    format!("{prefix}{SEPARATOR}{user_id}{SEPARATOR}{event_id}")
}

/// Recover `(user_id, event_id)` from a key.
///
/// The second segment is the user id. A missing or non-numeric third
/// segment yields `event_id == 0`; zero is therefore not a valid id.
pub fn parse_topic(key: &str) -> (String, u64) {
    let mut segments = key.split(SEPARATOR).skip(1);
    let user_id = segments.next().unwrap_or_default().to_string();
    let event_id = segments
        .next()
        .and_then(|id| id.parse::<u64>().ok())
        .unwrap_or(0);
    (user_id, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_topic() {
        assert_eq!(format_topic("events", "u1", 42), "events/u1/42");
        assert_eq!(TopicCodec::default().format("tenant-a", 7), "events/tenant-a/7");
    }

    #[test]
    fn test_parse_inverts_format() {
        let cases = [("u1", 1), ("tenant.with.dots", 0), ("", 9), ("x", u64::MAX)];
        for (user, id) in cases {
            let key = format_topic("events", user, id);
            assert_eq!(parse_topic(&key), (user.to_string(), id), "key {key}");
        }
    }

    #[test]
    fn test_parse_malformed_id_is_zero() {
        assert_eq!(parse_topic("events/u1/abc"), ("u1".to_string(), 0));
        assert_eq!(parse_topic("events/u1/-5"), ("u1".to_string(), 0));
        assert_eq!(parse_topic("events/u1"), ("u1".to_string(), 0));
        assert_eq!(parse_topic("events"), (String::new(), 0));
    }

    #[test]
    fn test_parse_ignores_trailing_segments() {
        assert_eq!(parse_topic("events/u1/3/extra"), ("u1".to_string(), 3));
    }

    #[test]
    fn test_is_valid_user_id() {
        assert!(is_valid_user_id("u1"));
        assert!(is_valid_user_id("tenant@example.com"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("a/b"));
    }

    #[test]
    fn test_owns() {
        let codec = TopicCodec::new("events");
        assert!(codec.owns("events/u1/1"));
        assert!(!codec.owns("eventsx/u1/1"));
        assert!(!codec.owns("other/u1/1"));
        assert!(!codec.owns("events"));
        assert_eq!(codec.watch_prefix(), "events/");
    }
}
