//! Stanza-protocol chat engine: a persistent WebSocket session with
//! login handshake, room subscriptions, request correlation and event
//! classification.
//!
//! The entry point is [`ChatClient`]; everything underneath is public
//! for embedders that need finer control over the pipeline.

pub mod address;
pub mod cache;
pub mod classify;
pub mod client;
pub mod correlator;
pub mod element;
pub mod error;
pub mod rooms;
pub mod session;
pub mod stanza;
pub mod transport;

pub use address::Address;
pub use cache::{ContextCache, ContextFetch};
pub use client::{ChatClient, RoomEvents, RoomHandle, SentMessage};
pub use element::Element;
pub use error::{ChatError, FormatError};
pub use session::{SessionHandle, SessionStatus};
pub use stanza::{Stanza, StanzaRegistry};
pub use transport::{WireSocket, WsSocket};
