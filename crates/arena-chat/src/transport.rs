use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arena_core::config::ChatConfig;
use arena_core::event::{Channel, DisconnectCause, Event, EventBus, EventPayload, EventSource};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChatError;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const OUTBOUND_QUEUE_DEPTH: usize = 256;
const INSTANT_QUEUE_DEPTH: usize = 32;
const LINK_QUEUE_DEPTH: usize = 1024;

/// One frame-oriented socket attempt. Implementations connect once;
/// reconnection is the supervisor's job.
pub trait WireSocket: Send + 'static {
    fn connect(config: &ChatConfig) -> impl Future<Output = Result<Self, ChatError>> + Send
    where
        Self: Sized;

    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), ChatError>> + Send;

    /// Next text frame. `Ok(None)` signals an orderly close by the peer.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, ChatError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ChatError>> + Send;
}

/// WebSocket implementation over tokio-tungstenite. Text frames only;
/// binary frames are decoded as UTF-8 and control frames are handled
/// by the library.
pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WireSocket for WsSocket {
    async fn connect(config: &ChatConfig) -> Result<Self, ChatError> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|error| ChatError::Transport(format!("bad endpoint: {error}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&config.subprotocol)
                .map_err(|error| ChatError::Transport(format!("bad subprotocol: {error}")))?,
        );

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| ChatError::Transport(format!("websocket connect: {error}")))?;
        debug!(status = %response.status(), endpoint = %config.endpoint, "websocket established");
        Ok(Self { stream })
    }

    async fn send(&mut self, text: &str) -> Result<(), ChatError> {
        self.stream
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .map_err(|error| ChatError::Transport(format!("websocket send: {error}")))
    }

    async fn recv(&mut self) -> Result<Option<String>, ChatError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(None);
            };
            match frame {
                Ok(WsMessage::Text(text)) => return Ok(Some(text.to_string())),
                Ok(WsMessage::Binary(bytes)) => {
                    let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                        ChatError::Transport("binary frame is not valid UTF-8".into())
                    })?;
                    return Ok(Some(text));
                }
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(error) => {
                    return Err(ChatError::Transport(format!("websocket recv: {error}")))
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.stream
            .close(None)
            .await
            .map_err(|error| ChatError::Transport(format!("websocket close: {error}")))
    }
}

/// What the link delivers upward to the session engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// A (re)connected socket is ready for the handshake.
    Up { reconnect: bool },
    /// One inbound text frame.
    Frame(String),
    /// The socket went away.
    Down(DisconnectCause),
}

/// Writer half handed to the session engine.
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<String>,
    instant: mpsc::Sender<String>,
    connected: watch::Receiver<bool>,
}

impl TransportHandle {
    /// Queue a frame for the live socket. Fails fast when the link is
    /// down instead of buffering into a dead connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ChatError> {
        if !*self.connected.borrow() {
            return Err(ChatError::NotReady);
        }
        self.outbound
            .send(text.into())
            .await
            .map_err(|_| ChatError::NotReady)
    }

    /// Jump the outbound queue: the pump drains this lane before any
    /// regular frame. For small control frames on the critical path,
    /// handshake steps and typing notices.
    pub async fn send_instant(&self, text: impl Into<String>) -> Result<(), ChatError> {
        if !*self.connected.borrow() {
            return Err(ChatError::NotReady);
        }
        self.instant
            .send(text.into())
            .await
            .map_err(|_| ChatError::NotReady)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolves when the link state changes; used by callers waiting
    /// out a reconnect.
    pub async fn connection_changed(&mut self) -> bool {
        if self.connected.changed().await.is_err() {
            return false;
        }
        *self.connected.borrow()
    }
}

/// Supervises one socket at a time: connects, pumps frames both ways,
/// and reconnects with backoff until shut down.
pub struct Transport;

impl Transport {
    pub fn spawn<S, B>(
        config: Arc<ChatConfig>,
        bus: Arc<B>,
        shutdown: CancellationToken,
    ) -> (TransportHandle, mpsc::Receiver<Link>)
    where
        S: WireSocket,
        B: EventBus,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (instant_tx, instant_rx) = mpsc::channel(INSTANT_QUEUE_DEPTH);
        let (link_tx, link_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let (connected_tx, connected_rx) = watch::channel(false);

        tokio::spawn(run_supervisor::<S, B>(
            config,
            bus,
            shutdown,
            outbound_rx,
            instant_rx,
            link_tx,
            connected_tx,
        ));

        (
            TransportHandle {
                outbound: outbound_tx,
                instant: instant_tx,
                connected: connected_rx,
            },
            link_rx,
        )
    }
}

async fn run_supervisor<S: WireSocket, B: EventBus>(
    config: Arc<ChatConfig>,
    bus: Arc<B>,
    shutdown: CancellationToken,
    mut outbound_rx: mpsc::Receiver<String>,
    mut instant_rx: mpsc::Receiver<String>,
    link_tx: mpsc::Sender<Link>,
    connected_tx: watch::Sender<bool>,
) {
    let channel = lifecycle_channel();
    let mut attempt: u32 = 0;
    let mut had_session = false;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let payload = if had_session {
            attempt += 1;
            EventPayload::Reconnecting { attempt }
        } else {
            EventPayload::Connecting
        };
        publish(&bus, &channel, payload);

        let connecting = S::connect(&config);
        let socket = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connecting => result,
        };

        let mut socket = match socket {
            Ok(socket) => socket,
            Err(error) => {
                warn!(%error, attempt, "connection attempt failed");
                publish(
                    &bus,
                    &channel,
                    EventPayload::ConnectionFailed {
                        reason: error.to_string(),
                    },
                );
                if !config.auto_reconnect {
                    break;
                }
                let delay = backoff(config.error_reconnect_delay(), attempt.max(1));
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let _ = connected_tx.send(true);
        publish(
            &bus,
            &channel,
            if had_session {
                EventPayload::Reconnected
            } else {
                EventPayload::Connected
            },
        );
        if link_tx
            .send(Link::Up {
                reconnect: had_session,
            })
            .await
            .is_err()
        {
            break;
        }
        had_session = true;
        attempt = 0;

        let cause = pump(
            &mut socket,
            &config,
            &shutdown,
            &mut outbound_rx,
            &mut instant_rx,
            &link_tx,
        )
        .await;

        let _ = connected_tx.send(false);
        // transient loss goes straight to Reconnecting; Disconnected
        // marks the terminal give-up or user-initiated close
        let terminal = cause == DisconnectCause::User || !config.auto_reconnect;
        if terminal {
            publish(&bus, &channel, EventPayload::Disconnected { cause });
        }
        let _ = link_tx.send(Link::Down(cause)).await;

        match cause {
            _ if terminal => break,
            DisconnectCause::Error => {
                attempt = 1;
                let delay = backoff(config.error_reconnect_delay(), attempt);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            _ => {
                attempt = 1;
                let delay = backoff(config.reconnect_delay(), attempt);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let _ = connected_tx.send(false);
    debug!("transport supervisor stopped");
}

/// Drive one live socket until it dies or the caller shuts down.
async fn pump<S: WireSocket>(
    socket: &mut S,
    config: &ChatConfig,
    shutdown: &CancellationToken,
    outbound_rx: &mut mpsc::Receiver<String>,
    instant_rx: &mut mpsc::Receiver<String>,
    link_tx: &mpsc::Sender<Link>,
) -> DisconnectCause {
    loop {
        tokio::select! {
            // drain the instant lane ahead of the regular queue
            biased;
            _ = shutdown.cancelled() => {
                let _ = socket.close().await;
                return DisconnectCause::User;
            }
            urgent = instant_rx.recv() => {
                let Some(text) = urgent else {
                    let _ = socket.close().await;
                    return DisconnectCause::User;
                };
                if let Err(error) = socket.send(&text).await {
                    warn!(%error, "instant send failed");
                    return DisconnectCause::Error;
                }
            }
            queued = outbound_rx.recv() => {
                let Some(text) = queued else {
                    let _ = socket.close().await;
                    return DisconnectCause::User;
                };
                if let Err(error) = socket.send(&text).await {
                    warn!(%error, "outbound send failed");
                    return DisconnectCause::Error;
                }
            }
            inbound = tokio::time::timeout(config.keepalive(), socket.recv()) => {
                match inbound {
                    Err(_) => {
                        debug!(silence_secs = config.keepalive_secs, "keepalive window elapsed");
                        let _ = socket.close().await;
                        return DisconnectCause::IdleTimeout;
                    }
                    Ok(Ok(Some(text))) => {
                        // servers use whitespace frames as keepalive
                        if text.trim().is_empty() {
                            continue;
                        }
                        if link_tx.send(Link::Frame(text)).await.is_err() {
                            return DisconnectCause::User;
                        }
                    }
                    Ok(Ok(None)) => return DisconnectCause::Server,
                    Ok(Err(error)) => {
                        warn!(%error, "inbound recv failed");
                        return DisconnectCause::Error;
                    }
                }
            }
        }
    }
}

fn lifecycle_channel() -> Channel {
    Channel::new("system.connection").unwrap_or_else(|_| unreachable!("static channel name"))
}

fn publish<B: EventBus>(bus: &Arc<B>, channel: &Channel, payload: EventPayload) {
    let event = Event::new(channel.clone(), EventSource::Transport, payload);
    if let Err(error) = bus.publish(event) {
        debug!(%error, "lifecycle event dropped");
    }
}

/// Exponential backoff from `base`, capped at one minute.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(6));
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}
