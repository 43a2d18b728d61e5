//! `topic#channel` identifier handling.
//!
//! Subscribing and publishing split identifiers with two different rules:
//! - [`TopicChannel::parse`] only splits when the delimiter is followed by at
//!   least one character. `"orders#"` stays the topic `"orders#"` on the
//!   default channel.
//! - [`publish_topic`] always cuts at the first delimiter, so `"orders#"`
//!   publishes to `"orders"`.

/// Channel used when an identifier names no channel.
pub const DEFAULT_CHANNEL_NAME: &str = "default";

/// Separator between topic and channel.
pub const CHANNEL_DELIMITER: char = '#';

/// Topic/channel pair a consumer is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicChannel {
    pub topic: String,
    pub channel: String,
}

impl TopicChannel {
    /// Split a subscribe identifier on the first delimiter.
    pub fn parse(raw: &str) -> Self {
        match raw.find(CHANNEL_DELIMITER) {
            Some(i) if i + CHANNEL_DELIMITER.len_utf8() < raw.len() => Self {
                topic: raw[..i].to_string(),
                channel: raw[i + CHANNEL_DELIMITER.len_utf8()..].to_string(),
            },
            _ => Self {
                topic: raw.to_string(),
                channel: DEFAULT_CHANNEL_NAME.to_string(),
            },
        }
    }

    /// Encode back into `topic#channel` form.
    pub fn to_identifier(&self) -> String {
        format!("{}{}{}", self.topic, CHANNEL_DELIMITER, self.channel)
    }
}

/// Topic a publish identifier refers to.
pub fn publish_topic(raw: &str) -> &str {
    raw.split_once(CHANNEL_DELIMITER)
        .map_or(raw, |(topic, _)| topic)
}
