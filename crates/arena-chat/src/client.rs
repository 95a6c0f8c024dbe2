use std::sync::Arc;

use arena_core::config::{ChatConfig, Config};
use arena_core::error::EventBusError;
use arena_core::event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventScope, EventSource,
    EventSubscription, RoomContext,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::cache::{ContextCache, ContextFetch};
use crate::classify::Classifier;
use crate::correlator::{self, Correlator};
use crate::element::Element;
use crate::error::ChatError;
use crate::rooms::RoomManager;
use crate::session::{Session, SessionHandle, SessionItem};
use crate::stanza::Stanza;
use crate::transport::{Transport, TransportHandle, WireSocket};

/// Default subscription priority for rooms joined through the client.
const ROOM_PRIORITY: i64 = 1;
/// Handshake budget: several correlated round trips.
const LOGIN_TIMEOUT_STEPS: u32 = 6;
const RAW_QUEUE_DEPTH: usize = 256;

/// Outcome of a correlated send: the stanza id chosen locally and the
/// durable resource id the server assigned, when it echoed one.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub id: String,
    pub resource_id: Option<String>,
}

/// The persistent chat client: owns the transport, the login session,
/// room subscriptions and classification, and exposes messaging
/// operations plus the event stream.
pub struct ChatClient<F: ContextFetch> {
    chat_config: Arc<ChatConfig>,
    bus: Arc<BroadcastEventBus>,
    transport: TransportHandle,
    session: SessionHandle,
    correlator: Arc<Correlator>,
    rooms: Arc<RoomManager<BroadcastEventBus>>,
    cache: Arc<ContextCache<F>>,
    raw_rx: Mutex<Option<mpsc::Receiver<Element>>>,
    shutdown: CancellationToken,
}

impl<F: ContextFetch> ChatClient<F> {
    /// Wire everything up and start connecting in the background. Call
    /// [`login`](Self::login) to wait for the session.
    pub fn connect<S: WireSocket>(config: Config, fetch: Arc<F>) -> Self {
        let chat_config = Arc::new(config.chat.clone());
        let bus = Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        let shutdown = CancellationToken::new();
        let correlator = Arc::new(Correlator::new());

        let cache = Arc::new(ContextCache::new(fetch, config.rest.cache_ttl()));
        cache.spawn_sweeper(config.rest.cache_sweep_interval(), shutdown.child_token());

        let (transport, link_rx) = Transport::spawn::<S, _>(
            Arc::clone(&chat_config),
            Arc::clone(&bus),
            shutdown.clone(),
        );

        let (session, items) = Session::spawn(
            Arc::clone(&chat_config),
            config.account.clone(),
            Arc::clone(&bus),
            transport.clone(),
            link_rx,
            Arc::clone(&correlator),
            shutdown.clone(),
        );

        let conference = format!("conference.{}", endpoint_host(&chat_config.endpoint));
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&chat_config),
            Arc::clone(&bus),
            transport.clone(),
            Arc::clone(&correlator),
            conference,
        ));

        let classifier = Classifier::new(
            Arc::clone(&cache),
            Arc::clone(&bus),
            config.account.user_id.clone(),
        );

        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_DEPTH);
        tokio::spawn(run_dispatch(
            items,
            classifier,
            Arc::clone(&rooms),
            Arc::clone(&bus),
            raw_tx,
        ));

        // tracked subscriptions are not durable server-side; a terminal
        // disconnect forgets them
        if let Ok(lifecycle) = bus.subscribe("system.connection") {
            tokio::spawn(run_subscription_reaper(lifecycle, Arc::clone(&rooms)));
        }

        Self {
            chat_config,
            bus,
            transport,
            session,
            correlator,
            rooms,
            cache,
            raw_rx: Mutex::new(Some(raw_rx)),
            shutdown,
        }
    }

    /// Wait for the connection and handshake to complete.
    pub async fn login(&self) -> Result<Address, ChatError> {
        let budget = self.chat_config.request_timeout() * LOGIN_TIMEOUT_STEPS;
        self.session.clone().wait_ready(budget).await
    }

    /// Tear the session down. Subscriptions are forgotten; the server
    /// sees an orderly close.
    pub fn logout(&self) {
        self.rooms.clear();
        self.shutdown.cancel();
    }

    /// Subscribe to events matching a glob pattern, e.g. `chat.*`.
    pub fn events(&self, pattern: &str) -> Result<EventSubscription, ChatError> {
        self.bus
            .subscribe(pattern)
            .map_err(|error| ChatError::Protocol(error.to_string()))
    }

    /// Elements no parser recognized, in arrival order. Takeable once.
    pub async fn raw_elements(&self) -> Option<mpsc::Receiver<Element>> {
        self.raw_rx.lock().await.take()
    }

    pub fn cache(&self) -> &Arc<ContextCache<F>> {
        &self.cache
    }

    /// Whether a room subscription is currently tracked.
    pub fn is_subscribed(&self, target: &Address) -> bool {
        self.rooms.is_subscribed(target)
    }

    /// Join a hub's general room.
    pub async fn subscribe_hub(&self, hub_id: &str) -> Result<RoomHandle, ChatError> {
        let target = self.rooms.hub_room(hub_id)?;
        self.rooms.subscribe(&target, ROOM_PRIORITY).await?;
        Ok(self.handle_for(target))
    }

    /// Join a match room together with both team rooms.
    pub async fn subscribe_match(&self, match_id: &str) -> Result<RoomHandle, ChatError> {
        let [left, right] = &self.chat_config.team_keys;
        self.rooms
            .subscribe_match(match_id, [left.as_str(), right.as_str()], ROOM_PRIORITY)
            .await?;
        Ok(self.handle_for(self.rooms.match_room(match_id)?))
    }

    /// A handle for a team room of a match, by configured side index.
    pub fn team_room(&self, match_id: &str, side: usize) -> Result<RoomHandle, ChatError> {
        let key = self
            .chat_config
            .team_keys
            .get(side)
            .ok_or_else(|| ChatError::Protocol(format!("no team side {side}")))?;
        Ok(self.handle_for(self.rooms.team_room(match_id, key)?))
    }

    fn handle_for(&self, target: Address) -> RoomHandle {
        RoomHandle {
            target,
            chat_config: Arc::clone(&self.chat_config),
            bus: Arc::clone(&self.bus),
            transport: self.transport.clone(),
            correlator: Arc::clone(&self.correlator),
            rooms: Arc::clone(&self.rooms),
        }
    }
}

/// Messaging surface of one subscribed room.
#[derive(Clone)]
pub struct RoomHandle {
    target: Address,
    chat_config: Arc<ChatConfig>,
    bus: Arc<BroadcastEventBus>,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    rooms: Arc<RoomManager<BroadcastEventBus>>,
}

impl RoomHandle {
    pub fn address(&self) -> &Address {
        &self.target
    }

    /// Classified chat events scoped to this room only.
    pub fn events(&self) -> Result<RoomEvents, ChatError> {
        let inner = self
            .bus
            .subscribe("chat.*")
            .map_err(|error| ChatError::Protocol(error.to_string()))?;
        Ok(RoomEvents {
            target: self.target.without_resource(),
            inner,
        })
    }

    /// Send a chat message and wait for the server echo carrying the
    /// archival id.
    pub async fn send(&self, body: &str) -> Result<SentMessage, ChatError> {
        self.send_with(body, &[], &[]).await
    }

    /// Send a chat message with attached image references and user
    /// mentions.
    pub async fn send_with(
        &self,
        body: &str,
        images: &[&str],
        mentions: &[&str],
    ) -> Result<SentMessage, ChatError> {
        let id = Uuid::new_v4().to_string();
        let element = chat_element(&id, &self.target, body, images, mentions);
        self.echo(id, element).await
    }

    /// Replace an earlier message, addressed by its resource id.
    pub async fn edit(&self, resource_id: &str, body: &str) -> Result<SentMessage, ChatError> {
        let id = Uuid::new_v4().to_string();
        let element = edit_element(&id, &self.target, resource_id, body);
        self.echo(id, element).await
    }

    /// Delete an earlier message, addressed by its resource id.
    pub async fn delete(&self, resource_id: &str) -> Result<(), ChatError> {
        let id = Uuid::new_v4().to_string();
        let element = delete_element(&id, &self.target, resource_id);
        self.echo(id, element).await?;
        Ok(())
    }

    /// Fire-and-forget typing indicator, sent on the instant lane.
    pub async fn send_composing(&self) -> Result<(), ChatError> {
        self.transport
            .send_instant(composing_element(&self.target).to_wire())
            .await
    }

    pub async fn unsubscribe(&self) -> Result<(), ChatError> {
        self.rooms.unsubscribe(&self.target).await
    }

    async fn echo(&self, id: String, element: Element) -> Result<SentMessage, ChatError> {
        let predicate = correlator::all(vec![
            correlator::named("message"),
            correlator::with_id(id.clone()),
        ]);
        let reply = self
            .correlator
            .send_and_wait(
                &self.transport,
                element.to_wire(),
                predicate,
                self.chat_config.request_timeout(),
            )
            .await?;
        let resource_id = match reply {
            Stanza::Message(message) => message
                .resource_id()
                .filter(|echoed| *echoed != id)
                .map(str::to_string),
            _ => None,
        };
        Ok(SentMessage { id, resource_id })
    }
}

/// A chat event stream narrowed to a single room. Events from other
/// rooms are skipped in place.
pub struct RoomEvents {
    target: Address,
    inner: EventSubscription,
}

impl RoomEvents {
    pub async fn recv(&mut self) -> Result<Event, ChatError> {
        loop {
            let event = self
                .inner
                .recv()
                .await
                .map_err(|error| ChatError::Protocol(error.to_string()))?;
            if event_belongs_to(&event.payload, &self.target) {
                return Ok(event);
            }
        }
    }
}

fn event_belongs_to(payload: &EventPayload, room: &Address) -> bool {
    match payload {
        EventPayload::MessageReceived { message } => from_matches(&message.from, room),
        EventPayload::Composing { from, scope } => {
            from_matches(from, room) || scope_matches(scope, room)
        }
        EventPayload::MemberJoined { scope, .. } => scope_matches(scope, room),
        EventPayload::MessageDeleted { scope, .. } => scope_matches(scope, room),
        _ => false,
    }
}

fn from_matches(from: &str, room: &Address) -> bool {
    Address::parse(from)
        .map(|address| address.without_resource() == *room)
        .unwrap_or(false)
}

/// The room node a scope resolves to, mirroring the naming the
/// subscription manager uses.
fn scope_matches(scope: &EventScope, room: &Address) -> bool {
    let node = match scope.context {
        RoomContext::Hub => scope.hub_id.as_ref().map(|id| format!("hub-{id}-general")),
        RoomContext::Match => scope.match_id.as_ref().map(|id| format!("match-{id}")),
        RoomContext::Team => scope
            .match_id
            .as_ref()
            .zip(scope.team_id.as_ref())
            .map(|(match_id, team_id)| format!("team-{match_id}_{team_id}")),
        RoomContext::Unknown => None,
    };
    node.as_deref() == room.node()
}

async fn run_subscription_reaper(
    mut lifecycle: EventSubscription,
    rooms: Arc<RoomManager<BroadcastEventBus>>,
) {
    loop {
        match lifecycle.recv().await {
            Ok(event) => {
                if matches!(event.payload, EventPayload::Disconnected { .. }) {
                    rooms.clear();
                }
            }
            Err(EventBusError::Lagged(skipped)) => {
                debug!(skipped, "connection event stream lagged");
            }
            Err(_) => break,
        }
    }
}

async fn run_dispatch<F: ContextFetch>(
    mut items: mpsc::Receiver<SessionItem>,
    classifier: Classifier<F, BroadcastEventBus>,
    rooms: Arc<RoomManager<BroadcastEventBus>>,
    bus: Arc<BroadcastEventBus>,
    raw_tx: mpsc::Sender<Element>,
) {
    while let Some(item) = items.recv().await {
        match item {
            SessionItem::Ready { address, reconnect } => {
                // subscriptions must be live again before readiness is
                // announced to the application
                if reconnect {
                    rooms.replay().await;
                }
                announce_ready(&bus, &address);
            }
            SessionItem::Stanza(Stanza::Message(message)) => {
                classifier.process(message).await;
            }
            SessionItem::Stanza(other) => {
                debug!(stanza = other.name(), "no dispatch for stanza");
            }
            SessionItem::Raw(element) => {
                if raw_tx.try_send(element).is_err() {
                    debug!("raw element queue full or unclaimed");
                }
            }
            SessionItem::Ended => {}
        }
    }
    debug!("dispatch loop stopped");
}

fn announce_ready(bus: &Arc<BroadcastEventBus>, address: &Address) {
    let Ok(channel) = Channel::new("system.session") else {
        return;
    };
    let event = Event::new(
        channel,
        EventSource::Session,
        EventPayload::SessionReady {
            address: address.to_string(),
        },
    );
    if let Err(error) = bus.publish(event) {
        warn!(%error, "session ready event dropped");
    }
}

fn endpoint_host(endpoint: &str) -> String {
    url::Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| endpoint.to_string())
}

fn chat_element(
    id: &str,
    room: &Address,
    body: &str,
    images: &[&str],
    mentions: &[&str],
) -> Element {
    let mut element = Element::new("message");
    element
        .set_attr("id", id)
        .set_attr("to", room.to_string())
        .set_attr("type", "groupchat");
    let mut text = Element::new("body");
    text.set_text(body);
    element.append_child(text);
    for user in mentions {
        let mut reference = Element::new("reference");
        reference.set_attr("type", "mention").set_attr("user", *user);
        element.append_child(reference);
    }
    for uri in images {
        let mut reference = Element::new("reference");
        reference.set_attr("type", "image").set_attr("uri", *uri);
        element.append_child(reference);
    }
    element
}

fn edit_element(id: &str, room: &Address, resource_id: &str, body: &str) -> Element {
    let mut element = chat_element(id, room, body, &[], &[]);
    let mut marker = Element::new("x");
    marker
        .set_attr("editing", "true")
        .set_attr("target", resource_id);
    element.append_child(marker);
    element
}

fn delete_element(id: &str, room: &Address, resource_id: &str) -> Element {
    let mut element = Element::new("message");
    element
        .set_attr("id", id)
        .set_attr("to", room.to_string())
        .set_attr("type", "groupchat");
    let mut payload = Element::new("data");
    payload.set_attr("type", "delete").set_attr("id", resource_id);
    element.append_child(payload);
    element
}

fn composing_element(room: &Address) -> Element {
    let mut element = Element::new("message");
    element
        .set_attr("to", room.to_string())
        .set_attr("type", "groupchat");
    element.append_child(Element::new("composing"));
    element
}
