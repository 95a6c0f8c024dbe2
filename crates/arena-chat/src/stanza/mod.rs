mod iq;
mod message;
mod presence;
mod stream;

use std::collections::HashMap;

pub use iq::{Iq, IqType};
pub use message::{Archived, DataPayload, Message, ReadMarker, Reference, ReferenceKind};
pub use presence::Presence;
pub use stream::{auth_element, AuthChallenge, AuthFailure, AuthSuccess, Features, StreamStart};

use crate::address::Address;
use crate::element::Element;

/// One discrete protocol message unit, typed by its element name.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
    StreamStart(StreamStart),
    Features(Features),
    AuthSuccess(AuthSuccess),
    AuthFailure(AuthFailure),
    AuthChallenge(AuthChallenge),
}

impl Stanza {
    pub fn name(&self) -> &str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
            Stanza::StreamStart(_) => "stream:stream",
            Stanza::Features(_) => "stream:features",
            Stanza::AuthSuccess(_) => "success",
            Stanza::AuthFailure(_) => "failure",
            Stanza::AuthChallenge(_) => "challenge",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(message) => message.id.as_deref(),
            Stanza::Presence(presence) => presence.id.as_deref(),
            Stanza::Iq(iq) => Some(&iq.id),
            _ => None,
        }
    }

    pub fn from(&self) -> Option<&Address> {
        match self {
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
            _ => None,
        }
    }

    pub fn to(&self) -> Option<&Address> {
        match self {
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
            _ => None,
        }
    }
}

type ParseFn = fn(Element) -> Option<Stanza>;

/// Maps element tag names (case-insensitively) to typed stanza parsers.
///
/// Populated at startup; extensible for protocol additions. Elements
/// with no registered parser are handed back untouched so callers can
/// forward them on a side channel.
pub struct StanzaRegistry {
    parsers: HashMap<String, ParseFn>,
}

impl StanzaRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("message", |element| {
            Message::from_element(element).map(Stanza::Message)
        });
        registry.register("presence", |element| {
            Presence::from_element(element).map(Stanza::Presence)
        });
        registry.register("iq", |element| Iq::from_element(element).map(Stanza::Iq));
        registry.register("stream:stream", |element| {
            Some(Stanza::StreamStart(StreamStart::from_element(element)))
        });
        registry.register("open", |element| {
            Some(Stanza::StreamStart(StreamStart::from_element(element)))
        });
        registry.register("stream:features", |element| {
            Some(Stanza::Features(Features::from_element(element)))
        });
        registry.register("features", |element| {
            Some(Stanza::Features(Features::from_element(element)))
        });
        registry.register("success", |element| {
            Some(Stanza::AuthSuccess(AuthSuccess::from_element(element)))
        });
        registry.register("failure", |element| {
            Some(Stanza::AuthFailure(AuthFailure::from_element(element)))
        });
        registry.register("challenge", |element| {
            Some(Stanza::AuthChallenge(AuthChallenge::from_element(element)))
        });
        registry
    }

    pub fn register(&mut self, name: &str, parser: ParseFn) {
        self.parsers.insert(name.to_ascii_lowercase(), parser);
    }

    /// Parse an element into a typed stanza. Unrecognized (or
    /// unparseable) elements are returned as `Err` for raw passthrough.
    pub fn parse(&self, element: Element) -> Result<Stanza, Element> {
        let Some(parser) = self.parsers.get(&element.name().to_ascii_lowercase()) else {
            return Err(element);
        };
        // a registered parser may still reject a malformed element
        match parser(element.clone()) {
            Some(stanza) => Ok(stanza),
            None => Err(element),
        }
    }
}

impl Default for StanzaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_case_insensitively() {
        let registry = StanzaRegistry::with_defaults();
        let element = Element::parse("<MESSAGE from='a@srv'><body>hi</body></MESSAGE>").unwrap();
        let stanza = registry.parse(element).expect("should parse as message");
        assert!(matches!(stanza, Stanza::Message(_)));
    }

    #[test]
    fn unknown_elements_pass_through_raw() {
        let registry = StanzaRegistry::with_defaults();
        let element = Element::parse("<sm-ack h='5'/>").unwrap();
        let raw = registry.parse(element).expect_err("should not be typed");
        assert_eq!(raw.name(), "sm-ack");
        assert_eq!(raw.attr("h"), Some("5"));
    }

    #[test]
    fn custom_registration_extends_dispatch() {
        let mut registry = StanzaRegistry::empty();
        registry.register("ping", |element| {
            Iq::from_element(element).map(Stanza::Iq)
        });
        assert!(registry
            .parse(Element::parse("<message/>").unwrap())
            .is_err());
    }

    #[test]
    fn stanza_accessors_expose_envelope_fields() {
        let registry = StanzaRegistry::with_defaults();
        let element =
            Element::parse("<iq id='q1' type='result' from='srv' to='u1@srv/r1'/>").unwrap();
        let stanza = registry.parse(element).unwrap();
        assert_eq!(stanza.id(), Some("q1"));
        assert_eq!(stanza.from().map(|a| a.domain()), Some("srv"));
        assert_eq!(stanza.to().and_then(|a| a.resource()), Some("r1"));
    }
}
