use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::records::{Hub, MatchRecord, Team, User};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let parts: Vec<&str> = name.split('.').collect();
        if parts.is_empty() {
            return false;
        }

        matches!(parts[0], "system" | "chat" | "room")
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "chat.message.received")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Connection transport
    Transport,
    /// Session / handshake machinery
    Session,
    /// Room subscription manager
    Rooms,
    /// Stanza classifier
    Classifier,
    /// SDK-embedding application code
    Client(String),
}

/// Why a connection transitioned away from `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectCause {
    /// Explicit disconnect requested by the caller
    User,
    /// Server closed the link
    Server,
    /// Socket-level failure
    Error,
    /// No inbound traffic within the keepalive window
    IdleTimeout,
}

/// The room a classified event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomContext {
    Hub,
    Match,
    Team,
    Unknown,
}

/// Which side of a match a team room belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TeamSide {
    Left,
    Right,
}

/// Resolved context attached to every classified chat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    pub context: RoomContext,

    pub hub_id: Option<String>,
    pub match_id: Option<String>,
    pub team_id: Option<String>,

    /// Resolved records, when the context cache could supply them
    pub hub: Option<Hub>,
    pub match_record: Option<MatchRecord>,
    pub team: Option<Team>,
}

impl EventScope {
    pub fn unknown() -> Self {
        Self {
            context: RoomContext::Unknown,
            hub_id: None,
            match_id: None,
            team_id: None,
            hub: None,
            match_record: None,
            team: None,
        }
    }
}

/// A fully classified chat message (or edit, when `edited` is set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEvent {
    /// Stanza id of the message
    pub id: String,

    /// Server-side archival (resource) id, when present
    pub resource_id: Option<String>,

    /// Resolved author record
    pub author: User,

    /// Best-available timestamp: explicit stamp, payload timestamp,
    /// then receipt time
    pub timestamp: DateTime<Utc>,

    /// Sender address in wire form
    pub from: String,

    /// Recipient address in wire form
    pub to: String,

    /// Concatenated body text
    pub body: String,

    /// Attached image references
    #[serde(default)]
    pub images: Vec<String>,

    /// Resolved @-mentioned users
    #[serde(default)]
    pub mentions: Vec<User>,

    pub mentions_everyone: bool,
    pub mentions_here: bool,

    /// Whether the current identity is among the mentions
    pub mentions_me: bool,

    /// Set only in team context
    pub team_side: Option<TeamSide>,

    /// True when this message replaces an earlier one
    pub edited: bool,

    pub scope: EventScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle ──────────────────────────────────────
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Reconnected,
    Disconnected {
        cause: DisconnectCause,
    },
    ConnectionFailed {
        reason: String,
    },
    SessionReady {
        address: String,
    },
    SessionEnded,
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Classified chat events ────────────────────────────────────
    MessageReceived {
        message: ChatMessageEvent,
    },
    Composing {
        from: String,
        scope: EventScope,
    },
    MemberJoined {
        user: User,
        scope: EventScope,
    },
    MessageDeleted {
        message_id: String,
        scope: EventScope,
    },
    ReadReceipt {
        from: String,
        message_id: Option<String>,
    },

    // ── Room subscription events ──────────────────────────────────
    Subscribed {
        target: String,
    },
    Unsubscribed {
        target: String,
    },
    SubscriptionsReplayed {
        count: usize,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    chat_sender: broadcast::Sender<Event>,
    room_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (chat_sender, _) = broadcast::channel(capacity);
        let (room_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            chat_sender,
            room_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "chat" => Some(&self.chat_sender),
            "room" => Some(&self.room_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                chat: Some(self.chat_sender.subscribe()),
                room: Some(self.room_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                chat: None,
                room: None,
            }),
            "chat" => Ok(DomainReceivers {
                system: None,
                chat: Some(self.chat_sender.subscribe()),
                room: None,
            }),
            "room" => Ok(DomainReceivers {
                system: None,
                chat: None,
                room: Some(self.room_sender.subscribe()),
            }),
            _ => Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            )),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    chat: Option<broadcast::Receiver<Event>>,
    room: Option<broadcast::Receiver<Event>>,
}

/// A live subscription; dropping it unsubscribes deterministically.
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let chat_receiver = self.receivers.chat.as_mut();
            let room_receiver = self.receivers.room.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(chat_receiver) => result,
                result = recv_from_domain(room_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("system.connection.connected"));
        assert!(Channel::is_valid("chat.message.received"));
        assert!(Channel::is_valid("room.subscription.added"));

        assert!(!Channel::is_valid("invalid.domain.event"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain() {
        let c = Channel::new("chat.message.received").unwrap();
        assert_eq!(c.domain(), "chat");
    }

    #[test]
    fn channel_new_rejects_invalid() {
        let result = Channel::new("bad.domain.event");
        assert!(matches!(
            result,
            Err(crate::error::EventBusError::InvalidChannel(_))
        ));
    }

    #[test]
    fn event_new_fields() {
        let channel = Channel::new("system.connection.connected").unwrap();
        let event = Event::new(channel.clone(), EventSource::Transport, EventPayload::Connected);

        assert_eq!(event.channel, channel);
        assert!(!event.id.is_nil());
    }
}

#[cfg(test)]
mod event_bus_tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(Channel::new(channel).unwrap(), EventSource::Transport, payload)
    }

    #[tokio::test]
    async fn publish_routes_to_matching_domain_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event("system.connection.connected", EventPayload::Connected))
            .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "system.connection.connected");
    }

    #[tokio::test]
    async fn chat_event_not_received_by_system_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event(
            "chat.receipt.read",
            EventPayload::ReadReceipt {
                from: "u1@srv".into(),
                message_id: None,
            },
        ))
        .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "system subscriber should not receive chat events");
    }

    #[tokio::test]
    async fn glob_filters_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("chat.message.*").unwrap();

        bus.publish(make_event(
            "chat.composing.started",
            EventPayload::Composing {
                from: "u2@srv".into(),
                scope: EventScope::unknown(),
            },
        ))
        .unwrap();
        bus.publish(make_event(
            "chat.message.deleted",
            EventPayload::MessageDeleted {
                message_id: "m1".into(),
                scope: EventScope::unknown(),
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "chat.message.deleted");
    }

    #[tokio::test]
    async fn wildcard_first_segment_receives_all_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("**").unwrap();

        bus.publish(make_event("system.connection.connecting", EventPayload::Connecting))
            .unwrap();
        bus.publish(make_event(
            "room.subscription.added",
            EventPayload::Subscribed {
                target: "match-1@conf".into(),
            },
        ))
        .unwrap();

        let mut channels = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            channels.push(event.channel.as_str().to_string());
        }
        channels.sort();
        assert_eq!(
            channels,
            vec!["room.subscription.added", "system.connection.connecting"]
        );
    }

    #[tokio::test]
    async fn subscribe_unknown_literal_domain_returns_error() {
        let bus = BroadcastEventBus::default();
        let result = bus.subscribe("unknown.domain.event");
        assert!(matches!(
            result,
            Err(crate::error::EventBusError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn events_within_domain_preserve_publish_order() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("chat.**").unwrap();

        for i in 0..10 {
            bus.publish(make_event(
                "chat.message.deleted",
                EventPayload::MessageDeleted {
                    message_id: format!("m{i}"),
                    scope: EventScope::unknown(),
                },
            ))
            .unwrap();
        }

        for i in 0..10 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            match &event.payload {
                EventPayload::MessageDeleted { message_id, .. } => {
                    assert_eq!(message_id, &format!("m{i}"), "out of order at index {i}");
                }
                _ => panic!("unexpected payload"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_bus_closes_subscription() {
        let mut sub;
        {
            let bus = BroadcastEventBus::default();
            sub = bus.subscribe("system.**").unwrap();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(crate::error::EventBusError::ChannelClosed)));
    }
}
