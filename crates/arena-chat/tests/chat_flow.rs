//! End-to-end flows over an in-process scripted server: login
//! handshake, message classification and reconnect replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use arena_chat::cache::ContextFetch;
use arena_chat::element::Element;
use arena_chat::error::ChatError;
use arena_chat::transport::WireSocket;
use arena_chat::ChatClient;
use arena_core::config::{AccountConfig, ChatConfig, Config, EventBusConfig, LoggingConfig, RestConfig};
use arena_core::event::{EventPayload, RoomContext, TeamSide};
use arena_core::records::{Hub, Identity, MatchRecord, Team, Tournament, User};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

const CLOSE_SENTINEL: &str = "__close__";

/// Capture the engine's tracing output per test; `RUST_LOG` narrows it.
fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ── scripted server ──────────────────────────────────────────────────

struct ServerControl {
    current: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ServerControl {
    fn inject(&self, frame: &str) {
        if let Some(sender) = self.current.lock().unwrap().as_ref() {
            let _ = sender.send(frame.to_string());
        }
    }

    fn kill(&self) {
        self.inject(CLOSE_SENTINEL);
    }
}

fn servers() -> &'static Mutex<HashMap<String, Arc<ServerControl>>> {
    static SERVERS: OnceLock<Mutex<HashMap<String, Arc<ServerControl>>>> = OnceLock::new();
    SERVERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_server(endpoint: &str) -> Arc<ServerControl> {
    let control = Arc::new(ServerControl {
        current: Mutex::new(None),
    });
    servers()
        .lock()
        .unwrap()
        .insert(endpoint.to_string(), Arc::clone(&control));
    control
}

/// Speaks just enough of the protocol to drive the client through
/// login, subscriptions and message echoes.
struct FakeSocket {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
    authed: bool,
    domain: String,
    user: String,
}

impl WireSocket for FakeSocket {
    async fn connect(config: &ChatConfig) -> Result<Self, ChatError> {
        let control = servers()
            .lock()
            .unwrap()
            .get(&config.endpoint)
            .cloned()
            .ok_or_else(|| ChatError::Transport("no such server".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        *control.current.lock().unwrap() = Some(tx.clone());
        Ok(Self {
            rx,
            tx,
            authed: false,
            domain: String::new(),
            user: String::new(),
        })
    }

    async fn send(&mut self, text: &str) -> Result<(), ChatError> {
        let Some(element) = Element::parse(text) else {
            return Ok(());
        };
        let tx = self.tx.clone();
        let reply = move |frame: String| {
            let _ = tx.send(frame);
        };

        match element.name() {
            "open" => {
                if let Some(to) = element.attr("to") {
                    self.domain = to.to_string();
                }
                reply(format!("<open from=\"{}\" id=\"s1\"/>", self.domain));
                if self.authed {
                    reply("<stream:features><bind/><session/></stream:features>".into());
                } else {
                    reply(
                        "<stream:features><mechanisms><mechanism>PLAIN</mechanism>\
                         </mechanisms></stream:features>"
                            .into(),
                    );
                }
            }
            "auth" => {
                if let Some(payload) = element.text() {
                    if let Ok(decoded) = BASE64.decode(payload) {
                        let raw = String::from_utf8_lossy(&decoded).to_string();
                        if let Some(user) = raw.split('\0').nth(1) {
                            self.user = user.to_string();
                        }
                    }
                }
                self.authed = true;
                reply("<success/>".into());
            }
            "iq" => {
                let id = element.attr("id").unwrap_or_default();
                if element.child("bind").is_some() {
                    reply(format!(
                        "<iq id=\"{id}\" type=\"result\"><bind><jid>{}@{}/res1</jid></bind></iq>",
                        self.user, self.domain
                    ));
                } else if element.child("session").is_some() || element.child("ping").is_some() {
                    reply(format!("<iq id=\"{id}\" type=\"result\"/>"));
                }
            }
            "presence" => {
                if element.attr("type").is_none() {
                    if let (Some(to), Some(id)) = (element.attr("to"), element.attr("id")) {
                        reply(format!("<presence id=\"{id}\" from=\"{to}/owner\"/>"));
                    }
                }
            }
            "message" => {
                if let Some(id) = element.attr("id") {
                    let to = element.attr("to").unwrap_or_default();
                    reply(format!(
                        "<message id=\"{id}\" from=\"{to}/{}\" to=\"{}@{}\">\
                         <archived id=\"arch-{id}\" by=\"{}\" timestamp=\"1700000000000\"/>\
                         </message>",
                        self.user, self.user, self.domain, self.user
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, ChatError> {
        match self.rx.recv().await {
            Some(frame) if frame == CLOSE_SENTINEL => Ok(None),
            Some(frame) => Ok(Some(frame)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        Ok(())
    }
}

// ── record fixtures ──────────────────────────────────────────────────

struct FixtureFetch;

impl ContextFetch for FixtureFetch {
    fn hub(&self, id: &str) -> BoxFuture<'static, Option<Hub>> {
        let id = id.to_string();
        async move {
            Some(Hub {
                id,
                name: "Fixture Hub".into(),
                game: Some("cs2".into()),
                organizer_id: None,
                chat_room_id: None,
            })
        }
        .boxed()
    }

    fn match_record(&self, id: &str) -> BoxFuture<'static, Option<MatchRecord>> {
        let id = id.to_string();
        async move {
            Some(MatchRecord {
                id,
                game: Some("cs2".into()),
                region: None,
                status: Some("ongoing".into()),
                teams: vec![
                    Team {
                        id: "faction1".into(),
                        name: "Alpha".into(),
                        leader_id: None,
                        roster: vec!["u7".into()],
                    },
                    Team {
                        id: "faction2".into(),
                        name: "Bravo".into(),
                        leader_id: None,
                        roster: vec![],
                    },
                ],
                scheduled_at: None,
                chat_room_id: None,
            })
        }
        .boxed()
    }

    fn user(&self, id: &str) -> BoxFuture<'static, Option<User>> {
        let id = id.to_string();
        async move {
            Some(User {
                nickname: format!("nick-{id}"),
                id,
                avatar: None,
                country: None,
            })
        }
        .boxed()
    }

    fn tournament(&self, _id: &str) -> BoxFuture<'static, Option<Tournament>> {
        async { None }.boxed()
    }

    fn identity(&self, _id: &str) -> BoxFuture<'static, Option<Identity>> {
        async { None }.boxed()
    }
}

fn config_for(endpoint: &str) -> Config {
    Config {
        account: AccountConfig {
            user_id: "u1".into(),
            secret: "s3cret".into(),
            identity: None,
        },
        chat: ChatConfig {
            endpoint: endpoint.to_string(),
            reconnect_secs: 1,
            error_reconnect_secs: 1,
            ..ChatConfig::default()
        },
        rest: RestConfig::default(),
        logging: LoggingConfig::default(),
        event_bus: EventBusConfig::default(),
    }
}

// ── scenarios ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn login_handshake_reaches_ready_with_bound_address() {
    init_tracing();
    let endpoint = "wss://t1.example.com/ws";
    let _server = register_server(endpoint);

    let client = ChatClient::connect::<FakeSocket>(config_for(endpoint), Arc::new(FixtureFetch));
    let address = client.login().await.expect("login should succeed");
    assert_eq!(address.to_string(), "u1@t1.example.com/res1");

    client.logout();
}

#[tokio::test(start_paused = true)]
async fn team_message_is_classified_with_resolved_context() {
    init_tracing();
    let endpoint = "wss://t2.example.com/ws";
    let server = register_server(endpoint);

    let client = ChatClient::connect::<FakeSocket>(config_for(endpoint), Arc::new(FixtureFetch));
    client.login().await.expect("login should succeed");
    let mut chat_events = client.events("chat.*").expect("pattern should be valid");

    let room = client
        .subscribe_match("m1")
        .await
        .expect("match subscription should confirm");
    assert_eq!(
        room.address().to_string(),
        "match-m1@conference.t2.example.com"
    );

    // own echo first: it must be suppressed
    server.inject(
        "<message id='self-1' from='team-m1_faction1@conference.t2.example.com/u1' \
         to='u1@t2.example.com'><body>my own line</body></message>",
    );
    server.inject(
        "<message id='x1' from='team-m1_faction1@conference.t2.example.com/u7' \
         to='u1@t2.example.com'><body>hello</body></message>",
    );

    let event = chat_events.recv().await.expect("event should arrive");
    let EventPayload::MessageReceived { message } = event.payload else {
        panic!("expected a chat message, got {:?}", event.payload);
    };
    // the suppressed echo never surfaced; the peer's line did
    assert_eq!(message.body, "hello");
    assert_eq!(message.author.id, "u7");
    assert_eq!(message.author.nickname, "nick-u7");
    assert_eq!(message.scope.context, RoomContext::Team);
    assert_eq!(message.scope.match_id.as_deref(), Some("m1"));
    assert_eq!(message.team_side, Some(TeamSide::Left));

    client.logout();
}

#[tokio::test(start_paused = true)]
async fn sending_returns_the_archival_resource_id() {
    init_tracing();
    let endpoint = "wss://t3.example.com/ws";
    let _server = register_server(endpoint);

    let client = ChatClient::connect::<FakeSocket>(config_for(endpoint), Arc::new(FixtureFetch));
    client.login().await.expect("login should succeed");

    let room = client
        .subscribe_hub("h1")
        .await
        .expect("hub subscription should confirm");
    let sent = room.send("gl hf").await.expect("echo should arrive");
    assert_eq!(sent.resource_id.as_deref(), Some(format!("arch-{}", sent.id).as_str()));

    client.logout();
}

#[tokio::test(start_paused = true)]
async fn room_event_stream_skips_other_rooms() {
    init_tracing();
    let endpoint = "wss://t5.example.com/ws";
    let server = register_server(endpoint);

    let client = ChatClient::connect::<FakeSocket>(config_for(endpoint), Arc::new(FixtureFetch));
    client.login().await.expect("login should succeed");

    let here = client
        .subscribe_hub("h1")
        .await
        .expect("hub subscription should confirm");
    let _elsewhere = client
        .subscribe_hub("h2")
        .await
        .expect("hub subscription should confirm");
    let mut here_events = here.events().expect("room stream");

    server.inject(
        "<message id='a1' from='hub-h2-general@conference.t5.example.com/u7' \
         to='u1@t5.example.com'><body>elsewhere</body></message>",
    );
    server.inject(
        "<message id='a2' from='hub-h1-general@conference.t5.example.com/u7' \
         to='u1@t5.example.com'><body>here</body></message>",
    );

    let event = here_events.recv().await.expect("event should arrive");
    let EventPayload::MessageReceived { message } = event.payload else {
        panic!("expected a chat message, got {:?}", event.payload);
    };
    assert_eq!(message.body, "here");

    client.logout();
}

#[tokio::test(start_paused = true)]
async fn terminal_disconnect_clears_tracked_subscriptions() {
    init_tracing();
    let endpoint = "wss://t6.example.com/ws";
    let server = register_server(endpoint);
    let mut config = config_for(endpoint);
    config.chat.auto_reconnect = false;

    let client = ChatClient::connect::<FakeSocket>(config, Arc::new(FixtureFetch));
    client.login().await.expect("login should succeed");
    let mut lifecycle = client.events("system.connection").expect("valid pattern");

    let room = client
        .subscribe_hub("h1")
        .await
        .expect("hub subscription should confirm");
    assert!(client.is_subscribed(room.address()));

    server.kill();
    loop {
        let event = lifecycle.recv().await.expect("lifecycle event");
        if matches!(event.payload, EventPayload::Disconnected { .. }) {
            break;
        }
    }
    for _ in 0..32 {
        if !client.is_subscribed(room.address()) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!client.is_subscribed(room.address()));
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_subscriptions_before_announcing_ready() {
    init_tracing();
    let endpoint = "wss://t4.example.com/ws";
    let server = register_server(endpoint);

    let client = ChatClient::connect::<FakeSocket>(config_for(endpoint), Arc::new(FixtureFetch));
    client.login().await.expect("login should succeed");

    let mut system_events = client.events("system.session").expect("valid pattern");
    let mut room_events = client.events("room.*").expect("valid pattern");

    client
        .subscribe_hub("h1")
        .await
        .expect("hub subscription should confirm");
    // consume the initial Subscribed event
    let subscribed = room_events.recv().await.expect("subscribed event");
    assert!(matches!(subscribed.payload, EventPayload::Subscribed { .. }));

    server.kill();

    // skip the teardown notice; the next readiness announcement only
    // happens after replay
    loop {
        let event = system_events.recv().await.expect("session event");
        if matches!(event.payload, EventPayload::SessionReady { .. }) {
            break;
        }
    }

    let replayed = tokio::time::timeout(Duration::from_millis(50), room_events.recv())
        .await
        .expect("replay must precede the ready announcement")
        .expect("replay event");
    assert!(matches!(
        replayed.payload,
        EventPayload::SubscriptionsReplayed { count: 1 }
    ));

    client.logout();
}
