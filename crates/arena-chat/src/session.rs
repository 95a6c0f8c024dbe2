use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_core::config::{AccountConfig, ChatConfig};
use arena_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::address::Address;
use crate::correlator::{self, Correlator};
use crate::element::Element;
use crate::error::ChatError;
use crate::stanza::{self, Iq, Stanza, StanzaRegistry, StreamStart};
use crate::transport::{Link, TransportHandle};

const BIND_REQUEST_ID: &str = "bind_1";
const SESSION_REQUEST_ID: &str = "session_1";
const ITEM_QUEUE_DEPTH: usize = 1024;

/// Generates unique resource identifiers for binding. Each value
/// embeds the application version and a per-process random seed so
/// concurrent clients never collide on a resource.
pub struct ResourceSequence {
    prefix: String,
    counter: AtomicU64,
}

impl ResourceSequence {
    pub fn new(app_version: &str) -> Self {
        let seed: u32 = rand::random();
        Self {
            prefix: format!("{app_version}-{seed:08x}"),
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

/// Where the login state machine currently stands. One linear pass per
/// connection: open, authenticate, reopen, bind, establish, ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    Authenticating,
    Reopening,
    Binding,
    Establishing,
    Ready,
    Failed,
}

impl Phase {
    fn is_handshaking(self) -> bool {
        !matches!(self, Phase::Idle | Phase::Ready | Phase::Failed)
    }
}

/// Externally visible session state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Idle,
    Handshaking,
    Ready(Address),
    Failed(String),
}

/// What the session hands to the dispatch layer above it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionItem {
    /// Handshake finished; the bound address is live.
    Ready { address: Address, reconnect: bool },
    /// A typed stanza no correlation waiter claimed.
    Stanza(Stanza),
    /// An element with no registered parser.
    Raw(Element),
    /// The link dropped; a `Ready` follows after any reconnect.
    Ended,
}

#[derive(Clone)]
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait for the handshake to finish, one way or the other.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<Address, ChatError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let status = self.status.borrow().clone();
                match status {
                    SessionStatus::Ready(address) => return Ok(address),
                    SessionStatus::Failed(reason) => return Err(ChatError::Handshake(reason)),
                    _ => {}
                }
                if self.status.changed().await.is_err() {
                    return Err(ChatError::NotReady);
                }
            }
        })
        .await;
        outcome.map_err(|_| ChatError::Timeout)?
    }
}

/// Drives the login handshake over a supervised transport and routes
/// steady-state stanzas: correlation waiters first, dispatch second.
pub struct Session;

impl Session {
    pub fn spawn<B: EventBus>(
        config: Arc<ChatConfig>,
        account: AccountConfig,
        bus: Arc<B>,
        transport: TransportHandle,
        link_rx: mpsc::Receiver<Link>,
        correlator: Arc<Correlator>,
        shutdown: CancellationToken,
    ) -> (SessionHandle, mpsc::Receiver<SessionItem>) {
        let (item_tx, item_rx) = mpsc::channel(ITEM_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);

        let engine = Engine {
            config,
            account,
            bus,
            transport,
            correlator,
            registry: StanzaRegistry::with_defaults(),
            resources: ResourceSequence::new(""),
            item_tx,
            status_tx,
            shutdown: shutdown.clone(),
            phase: Phase::Idle,
            reconnect: false,
            domain: String::new(),
            deadline: Instant::now(),
            pending_address: None,
            ping_guard: None,
        };
        tokio::spawn(engine.run(link_rx));

        (SessionHandle { status: status_rx }, item_rx)
    }
}

struct Engine<B: EventBus> {
    config: Arc<ChatConfig>,
    account: AccountConfig,
    bus: Arc<B>,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    registry: StanzaRegistry,
    resources: ResourceSequence,
    item_tx: mpsc::Sender<SessionItem>,
    status_tx: watch::Sender<SessionStatus>,
    shutdown: CancellationToken,
    phase: Phase,
    reconnect: bool,
    domain: String,
    deadline: Instant,
    pending_address: Option<Address>,
    ping_guard: Option<CancellationToken>,
}

impl<B: EventBus> Engine<B> {
    async fn run(mut self, mut link_rx: mpsc::Receiver<Link>) {
        self.resources = ResourceSequence::new(&self.config.app_version);
        self.domain = endpoint_domain(&self.config.endpoint);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(self.deadline), if self.phase.is_handshaking() => {
                    self.fail("handshake step timed out").await;
                }
                item = link_rx.recv() => {
                    let Some(item) = item else { break };
                    match item {
                        Link::Up { reconnect } => self.begin(reconnect).await,
                        Link::Frame(text) => self.handle_frame(text).await,
                        Link::Down(_cause) => self.link_down().await,
                    }
                }
            }
        }
        self.stop_ping();
        debug!("session engine stopped");
    }

    async fn begin(&mut self, reconnect: bool) {
        self.reconnect = reconnect;
        self.phase = Phase::Opening;
        self.deadline = Instant::now() + self.config.request_timeout();
        let _ = self.status_tx.send(SessionStatus::Handshaking);

        let open = StreamStart::open(&self.domain).to_wire();
        if let Err(error) = self.transport.send_instant(open).await {
            self.fail(&format!("stream open send failed: {error}")).await;
        }
    }

    async fn link_down(&mut self) {
        self.stop_ping();
        if self.phase == Phase::Ready {
            self.publish(EventPayload::SessionEnded);
        }
        self.phase = Phase::Idle;
        let _ = self.status_tx.send(SessionStatus::Idle);
        let _ = self.item_tx.send(SessionItem::Ended).await;
    }

    async fn handle_frame(&mut self, text: String) {
        let Some(element) = Element::parse(&text) else {
            warn!(frame = %text, "discarding unparseable frame");
            return;
        };

        match self.registry.parse(element) {
            Ok(stanza) => {
                if self.phase == Phase::Ready {
                    if !self.correlator.offer(&stanza) {
                        let _ = self.item_tx.send(SessionItem::Stanza(stanza)).await;
                    }
                } else {
                    self.advance(stanza).await;
                }
            }
            Err(raw) => {
                if self.phase == Phase::Ready {
                    let _ = self.item_tx.send(SessionItem::Raw(raw)).await;
                } else {
                    debug!(name = raw.name(), "ignoring untyped element during handshake");
                }
            }
        }
    }

    /// One step of the login machine.
    async fn advance(&mut self, stanza: Stanza) {
        self.deadline = Instant::now() + self.config.request_timeout();

        match (self.phase, stanza) {
            // stream open acknowledged; features decide the next move
            (Phase::Opening, Stanza::StreamStart(_)) => {}
            (Phase::Opening, Stanza::Features(features)) => {
                if !features.mechanisms.is_empty() && !features.supports_plain() {
                    self.fail("server offers no PLAIN mechanism").await;
                    return;
                }
                let payload = plain_credentials(&self.account);
                let auth = stanza::auth_element("PLAIN", &payload).to_wire();
                self.phase = Phase::Authenticating;
                if let Err(error) = self.transport.send_instant(auth).await {
                    self.fail(&format!("auth send failed: {error}")).await;
                }
            }
            (Phase::Authenticating, Stanza::AuthSuccess(_)) => {
                // the stream restarts from scratch after authentication
                self.phase = Phase::Reopening;
                let open = StreamStart::open(&self.domain).to_wire();
                if let Err(error) = self.transport.send_instant(open).await {
                    self.fail(&format!("stream reopen send failed: {error}")).await;
                }
            }
            (Phase::Authenticating, Stanza::AuthFailure(failure)) => {
                let reason = failure
                    .text
                    .or(failure.condition)
                    .unwrap_or_else(|| "authentication rejected".into());
                self.fail(&reason).await;
            }
            (Phase::Authenticating, Stanza::AuthChallenge(_)) => {
                self.fail("unexpected SASL challenge for PLAIN").await;
            }
            (Phase::Reopening, Stanza::StreamStart(_)) => {}
            (Phase::Reopening, Stanza::Features(_)) => {
                let resource = self.resources.next();
                self.phase = Phase::Binding;
                let bind = Iq::bind_request(BIND_REQUEST_ID, &resource).to_wire();
                if let Err(error) = self.transport.send_instant(bind).await {
                    self.fail(&format!("bind send failed: {error}")).await;
                }
            }
            (Phase::Binding, Stanza::Iq(iq)) if iq.id == BIND_REQUEST_ID => {
                if iq.is_error() {
                    let reason = iq.error_text.unwrap_or_else(|| "bind rejected".into());
                    self.fail(&reason).await;
                    return;
                }
                let Some(address) = iq.bound_address else {
                    self.fail("bind result carried no address").await;
                    return;
                };
                self.phase = Phase::Establishing;
                self.pending_address = Some(address);
                let session = Iq::session_request(SESSION_REQUEST_ID).to_wire();
                if let Err(error) = self.transport.send_instant(session).await {
                    self.fail(&format!("session send failed: {error}")).await;
                }
            }
            (Phase::Establishing, Stanza::Iq(iq)) if iq.id == SESSION_REQUEST_ID => {
                if iq.is_error() {
                    let reason = iq.error_text.unwrap_or_else(|| "session rejected".into());
                    self.fail(&reason).await;
                    return;
                }
                self.ready().await;
            }
            (_, other) => {
                debug!(phase = ?self.phase, stanza = other.name(), "ignoring out-of-phase stanza");
            }
        }
    }

    async fn ready(&mut self) {
        let Some(address) = self.pending_address.clone() else {
            self.fail("ready without bound address").await;
            return;
        };
        self.phase = Phase::Ready;
        let _ = self.status_tx.send(SessionStatus::Ready(address.clone()));
        // the dispatch layer announces readiness once replayed
        // subscriptions are back in place
        self.start_ping();
        let _ = self
            .item_tx
            .send(SessionItem::Ready {
                address,
                reconnect: self.reconnect,
            })
            .await;
    }

    async fn fail(&mut self, reason: &str) {
        warn!(phase = ?self.phase, reason, "handshake failed");
        self.phase = Phase::Failed;
        self.stop_ping();
        let _ = self
            .status_tx
            .send(SessionStatus::Failed(reason.to_string()));
        self.publish(EventPayload::ErrorOccurred {
            component: "session".into(),
            message: reason.to_string(),
            recoverable: false,
        });
    }

    fn start_ping(&mut self) {
        self.stop_ping();
        let guard = self.shutdown.child_token();
        self.ping_guard = Some(guard.clone());
        tokio::spawn(run_ping_loop(
            Arc::clone(&self.config),
            self.transport.clone(),
            Arc::clone(&self.correlator),
            guard,
        ));
    }

    fn stop_ping(&mut self) {
        if let Some(guard) = self.ping_guard.take() {
            guard.cancel();
        }
    }

    fn publish(&self, payload: EventPayload) {
        let Ok(channel) = Channel::new("system.session") else {
            return;
        };
        let event = Event::new(channel, EventSource::Session, payload);
        if let Err(error) = self.bus.publish(event) {
            debug!(%error, "session event dropped");
        }
    }
}

/// Periodic liveness pings while the session is ready. Replies are
/// claimed through the correlator so they never reach dispatch. An
/// unanswered ping stops the loop; the transport idle timer owns the
/// hard failure path.
async fn run_ping_loop(
    config: Arc<ChatConfig>,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    guard: CancellationToken,
) {
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = tokio::time::sleep(config.ping_interval()) => {}
        }
        sequence += 1;
        let id = format!("ping_{sequence}");
        let frame = Iq::ping(&id).to_wire();
        let outcome = correlator
            .send_and_wait(
                &transport,
                frame,
                correlator::with_id(id),
                config.request_timeout(),
            )
            .await;
        if let Err(error) = outcome {
            warn!(%error, "keepalive ping went unanswered, stopping ping loop");
            return;
        }
    }
}

/// SASL PLAIN: authorization identity, user id and secret joined by
/// NUL bytes, base64 encoded.
fn plain_credentials(account: &AccountConfig) -> String {
    let identity = account.identity.as_deref().unwrap_or(&account.user_id);
    let raw = format!("{identity}\0{}\0{}", account.user_id, account.secret);
    BASE64.encode(raw.as_bytes())
}

/// The stream domain is the host part of the WebSocket endpoint.
fn endpoint_domain(endpoint: &str) -> String {
    Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| endpoint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_credentials_are_nul_joined_and_encoded() {
        let account = AccountConfig {
            user_id: "alice".into(),
            secret: "s3cret".into(),
            identity: None,
        };
        let encoded = plain_credentials(&account);
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"alice\0alice\0s3cret");
    }

    #[test]
    fn explicit_identity_overrides_user_id_prefix() {
        let account = AccountConfig {
            user_id: "alice".into(),
            secret: "s3cret".into(),
            identity: Some("ops".into()),
        };
        let decoded = BASE64.decode(plain_credentials(&account)).unwrap();
        assert_eq!(decoded, b"ops\0alice\0s3cret");
    }

    #[test]
    fn resource_sequence_embeds_version_and_increments() {
        let sequence = ResourceSequence::new("2.4.0");
        let first = sequence.next();
        let second = sequence.next();
        assert!(first.starts_with("2.4.0-"));
        assert_ne!(first, second);
        assert!(second.ends_with("-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_stops_the_loop() {
        use arena_core::event::BroadcastEventBus;

        use crate::transport::Transport;

        struct SilentSocket;

        impl crate::transport::WireSocket for SilentSocket {
            async fn connect(_config: &ChatConfig) -> Result<Self, ChatError> {
                Ok(Self)
            }

            async fn send(&mut self, _text: &str) -> Result<(), ChatError> {
                Ok(())
            }

            async fn recv(&mut self) -> Result<Option<String>, ChatError> {
                futures::future::pending::<()>().await;
                unreachable!()
            }

            async fn close(&mut self) -> Result<(), ChatError> {
                Ok(())
            }
        }

        let mut config = ChatConfig::default();
        config.ping_interval_secs = 1;
        config.request_timeout_secs = 1;
        let config = Arc::new(config);

        let bus = Arc::new(BroadcastEventBus::default());
        let shutdown = CancellationToken::new();
        let (transport, mut link_rx) =
            Transport::spawn::<SilentSocket, _>(Arc::clone(&config), bus, shutdown.clone());
        assert!(matches!(link_rx.recv().await, Some(Link::Up { .. })));

        let correlator = Arc::new(Correlator::new());
        let ping_loop = tokio::spawn(run_ping_loop(
            Arc::clone(&config),
            transport,
            Arc::clone(&correlator),
            CancellationToken::new(),
        ));

        // the first ping goes unanswered; the loop ends instead of
        // pinging again
        ping_loop.await.unwrap();
        assert_eq!(correlator.pending_count(), 0);
        shutdown.cancel();
    }

    #[test]
    fn endpoint_domain_extracts_host() {
        assert_eq!(
            endpoint_domain("wss://chat.example.com/ws?v=2"),
            "chat.example.com"
        );
        assert_eq!(endpoint_domain("not a url"), "not a url");
    }
}
