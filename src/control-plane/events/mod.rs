use chrono::{DateTime, Utc};
use strum_macros::{Display, EnumString};

pub mod broker;

/// Push channels published to subscribed dashboard clients. The set is
/// closed; every member maps one-to-one onto a WebSocket payload `type`.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum Channel {
    JobProgress,
    ArkChat,
    ArkLogData,
    ContainerLogData,
    ContainerEvent,
    SystemLogData,
}

pub const ALL_CHANNELS: [Channel; 6] = [
    Channel::JobProgress,
    Channel::ArkChat,
    Channel::ArkLogData,
    Channel::ContainerLogData,
    Channel::ContainerEvent,
    Channel::SystemLogData,
];

/// An event on a channel. `key` scopes the event within the channel (job id,
/// server name) so subscribers can filter; `content` is the serialized
/// payload pushed to clients verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub channel: Channel,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}
