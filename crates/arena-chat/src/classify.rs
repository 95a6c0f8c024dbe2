use std::sync::Arc;
use std::sync::OnceLock;

use arena_core::event::{
    Channel, ChatMessageEvent, Event, EventBus, EventPayload, EventScope, EventSource,
    RoomContext, TeamSide,
};
use arena_core::records::User;
use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use tracing::{debug, warn};

use crate::cache::{ContextCache, ContextFetch};
use crate::stanza::{Message, ReferenceKind};

fn team_room_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^team-([^_]+)_(.+)$").expect("team room pattern must compile")
    })
}

fn hub_room_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^hub-(.+)-general$").expect("hub room pattern must compile"))
}

fn match_room_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^match-(.+)$").expect("match room pattern must compile"))
}

/// Turns raw message stanzas into domain events with resolved context.
///
/// The room a message came from is recognized from its address node;
/// the matching platform records are pulled through the context cache.
/// Events whose author cannot be resolved are dropped rather than
/// published half-empty.
pub struct Classifier<F: ContextFetch, B: EventBus> {
    cache: Arc<ContextCache<F>>,
    bus: Arc<B>,
    self_user_id: String,
}

impl<F: ContextFetch, B: EventBus> Classifier<F, B> {
    pub fn new(cache: Arc<ContextCache<F>>, bus: Arc<B>, self_user_id: impl Into<String>) -> Self {
        Self {
            cache,
            bus,
            self_user_id: self_user_id.into(),
        }
    }

    /// Classify and publish. Returns how many events were published.
    pub async fn process(&self, message: Message) -> usize {
        let payloads = self.classify(message).await;
        let mut published = 0;
        for (channel_name, payload) in payloads {
            let Ok(channel) = Channel::new(channel_name) else {
                continue;
            };
            match self
                .bus
                .publish(Event::new(channel, EventSource::Classifier, payload))
            {
                Ok(()) => published += 1,
                Err(error) => debug!(%error, "classified event dropped"),
            }
        }
        published
    }

    /// Room derivation comes first: only a sender outside the room
    /// prefix conventions can be a read receipt. After that the first
    /// matching shape wins: typing indicators, joins, deletions, then
    /// chat bodies.
    pub async fn classify(&self, message: Message) -> Vec<(&'static str, EventPayload)> {
        let from = match &message.from {
            Some(from) => from.clone(),
            None => {
                debug!("message without sender ignored");
                return Vec::new();
            }
        };

        let scope = self.resolve_scope(&from).await;

        // conversation echo: bare sender equals bare recipient
        if scope.context == RoomContext::Unknown && message.is_receipt_echo() {
            let message_id = message
                .read
                .as_ref()
                .and_then(|marker| marker.message_id.clone());
            return vec![(
                "chat.receipt",
                EventPayload::ReadReceipt {
                    from: from.without_resource().to_string(),
                    message_id,
                },
            )];
        }

        let author_id = self.author_id(&message);

        if message.composing {
            if author_id.as_deref() == Some(self.self_user_id.as_str()) {
                return Vec::new();
            }
            return vec![(
                "chat.composing",
                EventPayload::Composing {
                    from: from.to_string(),
                    scope,
                },
            )];
        }

        let joins: Vec<String> = message.joins().map(str::to_string).collect();
        if !joins.is_empty() {
            let users = join_all(joins.iter().map(|id| self.cache.user(id))).await;
            return users
                .into_iter()
                .flatten()
                .map(|user| {
                    (
                        "chat.member",
                        EventPayload::MemberJoined {
                            user,
                            scope: scope.clone(),
                        },
                    )
                })
                .collect();
        }

        let deletions: Vec<String> = message.deletions().map(str::to_string).collect();
        if !deletions.is_empty() {
            return deletions
                .into_iter()
                .map(|message_id| {
                    (
                        "chat.deleted",
                        EventPayload::MessageDeleted {
                            message_id,
                            scope: scope.clone(),
                        },
                    )
                })
                .collect();
        }

        let Some(body) = message.body() else {
            debug!(from = %from, "message with no classifiable payload");
            return Vec::new();
        };

        let Some(author_id) = author_id else {
            debug!(from = %from, "chat message without author ignored");
            return Vec::new();
        };
        if author_id == self.self_user_id {
            // own echo, the caller already observed the send
            return Vec::new();
        }
        let Some(author) = self.cache.user(&author_id).await else {
            warn!(author_id, "dropping message with unresolvable author");
            return Vec::new();
        };

        let event = self.build_chat_event(&message, &from, body, author, scope).await;
        vec![("chat.message", EventPayload::MessageReceived { message: event })]
    }

    async fn build_chat_event(
        &self,
        message: &Message,
        from: &crate::address::Address,
        body: String,
        author: User,
        scope: EventScope,
    ) -> ChatMessageEvent {
        let mut mentions_everyone = false;
        let mut mentions_here = false;
        let mut mention_ids = Vec::new();
        let mut images = Vec::new();

        for reference in &message.references {
            match &reference.kind {
                ReferenceKind::Mention => {
                    if let Some(user) = &reference.user {
                        mention_ids.push(user.clone());
                    }
                }
                ReferenceKind::MentionEveryone => mentions_everyone = true,
                ReferenceKind::MentionHere => mentions_here = true,
                ReferenceKind::Image => {
                    if let Some(uri) = &reference.uri {
                        images.push(uri.clone());
                    }
                }
                ReferenceKind::Other(_) => {}
            }
        }

        let mentions_me = mentions_everyone
            || mentions_here
            || mention_ids.iter().any(|id| *id == self.self_user_id);
        let mentions: Vec<User> = join_all(mention_ids.iter().map(|id| self.cache.user(id)))
            .await
            .into_iter()
            .flatten()
            .collect();

        let edited = message.edit_marker().is_some();
        let timestamp = message
            .stamp
            .or_else(|| {
                message
                    .edit_marker()
                    .and_then(|marker| marker.attr_timestamp("timestamp"))
            })
            .or_else(|| {
                message
                    .archived
                    .as_ref()
                    .and_then(|archived| archived.timestamp)
            })
            .unwrap_or_else(Utc::now);

        let team_side = team_side_of(&scope);

        ChatMessageEvent {
            id: message.id.clone().unwrap_or_default(),
            resource_id: message.resource_id().map(str::to_string),
            author,
            timestamp,
            from: from.to_string(),
            to: message
                .to
                .as_ref()
                .map(|to| to.to_string())
                .unwrap_or_default(),
            body,
            images,
            mentions,
            mentions_everyone,
            mentions_here,
            mentions_me,
            team_side,
            edited,
            scope,
        }
    }

    /// The author is the resource part of the room address; archival
    /// and edit metadata are fallbacks.
    fn author_id(&self, message: &Message) -> Option<String> {
        if let Some(resource) = message.from.as_ref().and_then(|from| from.resource()) {
            return Some(resource.to_string());
        }
        if let Some(by) = message
            .archived
            .as_ref()
            .and_then(|archived| archived.by.clone())
        {
            return Some(by);
        }
        message
            .edit_marker()
            .and_then(|marker| marker.attr("by"))
            .map(str::to_string)
    }

    /// Recognize the room kind from the address node and resolve its
    /// records. Match and team lookups share one match fetch.
    pub async fn resolve_scope(&self, from: &crate::address::Address) -> EventScope {
        let Some(node) = from.node() else {
            return EventScope::unknown();
        };

        if let Some(captures) = team_room_pattern().captures(node) {
            let match_id = captures[1].to_string();
            let team_id = captures[2].to_string();
            let match_record = self.cache.match_record(&match_id).await;
            let team = match_record
                .as_ref()
                .and_then(|record| record.team(&team_id))
                .cloned();
            return EventScope {
                context: RoomContext::Team,
                hub_id: None,
                match_id: Some(match_id),
                team_id: Some(team_id),
                hub: None,
                match_record,
                team,
            };
        }

        if let Some(captures) = hub_room_pattern().captures(node) {
            let hub_id = captures[1].to_string();
            let hub = self.cache.hub(&hub_id).await;
            return EventScope {
                context: RoomContext::Hub,
                hub_id: Some(hub_id),
                match_id: None,
                team_id: None,
                hub,
                match_record: None,
                team: None,
            };
        }

        if let Some(captures) = match_room_pattern().captures(node) {
            let match_id = captures[1].to_string();
            let match_record = self.cache.match_record(&match_id).await;
            return EventScope {
                context: RoomContext::Match,
                hub_id: None,
                match_id: Some(match_id),
                team_id: None,
                hub: None,
                match_record,
                team: None,
            };
        }

        EventScope::unknown()
    }
}

/// Which side a team room belongs to, by the team's position in the
/// match record.
fn team_side_of(scope: &EventScope) -> Option<TeamSide> {
    if scope.context != RoomContext::Team {
        return None;
    }
    let team_id = scope.team_id.as_deref()?;
    let record = scope.match_record.as_ref()?;
    match record.teams.iter().position(|team| team.id == team_id) {
        Some(0) => Some(TeamSide::Left),
        Some(1) => Some(TeamSide::Right),
        _ => None,
    }
}
