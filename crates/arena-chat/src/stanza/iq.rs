use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::element::Element;

const BIND_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const SESSION_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-session";
const PING_NAMESPACE: &str = "urn:xmpp:ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl FromStr for IqType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        })
    }
}

/// A typed view over an `<iq>` request/response element. Both the id
/// and a valid type are mandatory; elements missing either stay raw.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub kind: IqType,
    pub from: Option<Address>,
    pub to: Option<Address>,
    /// The address assigned by a bind result.
    pub bound_address: Option<Address>,
    /// Whether a `<session>` child is present.
    pub session: bool,
    pub error: Option<Element>,
    pub error_text: Option<String>,
    pub unknown: Vec<Element>,
}

impl Iq {
    pub fn from_element(element: Element) -> Option<Self> {
        if !element.name().eq_ignore_ascii_case("iq") {
            return None;
        }
        let id = element.attr("id")?.to_string();
        let kind: IqType = element.attr_parsed("type")?;

        let mut iq = Iq {
            id,
            kind,
            from: element.attr_address("from"),
            to: element.attr_address("to"),
            bound_address: None,
            session: false,
            error: None,
            error_text: None,
            unknown: Vec::new(),
        };

        for child in element.into_children() {
            match child.name().to_ascii_lowercase().as_str() {
                "bind" => {
                    iq.bound_address = child
                        .child("jid")
                        .or_else(|| child.child("address"))
                        .and_then(Element::text)
                        .and_then(|text| Address::parse(text.trim()).ok());
                }
                "session" => iq.session = true,
                "error" => {
                    iq.error_text = child
                        .child("text")
                        .and_then(Element::text)
                        .map(str::to_string);
                    iq.error = Some(child);
                }
                "text" => {
                    if iq.error_text.is_none() {
                        iq.error_text = child.text().map(str::to_string);
                    }
                }
                _ => iq.unknown.push(child),
            }
        }

        Some(iq)
    }

    pub fn is_result(&self) -> bool {
        self.kind == IqType::Result
    }

    pub fn is_error(&self) -> bool {
        self.kind == IqType::Error
    }

    /// Build a resource binding request.
    pub fn bind_request(id: impl Into<String>, resource: &str) -> Element {
        let mut bind = Element::with_namespace("bind", BIND_NAMESPACE);
        let mut slot = Element::new("resource");
        slot.set_text(resource);
        bind.append_child(slot);

        let mut element = Element::new("iq");
        element.set_attr("id", id).set_attr("type", "set");
        element.append_child(bind);
        element
    }

    /// Build a session establishment request.
    pub fn session_request(id: impl Into<String>) -> Element {
        let mut element = Element::new("iq");
        element.set_attr("id", id).set_attr("type", "set");
        element.append_child(Element::with_namespace("session", SESSION_NAMESPACE));
        element
    }

    /// Build a keepalive ping.
    pub fn ping(id: impl Into<String>) -> Element {
        let mut element = Element::new("iq");
        element.set_attr("id", id).set_attr("type", "get");
        element.append_child(Element::with_namespace("ping", PING_NAMESPACE));
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_result_with_bound_address() {
        let element = Element::parse(
            "<iq id='bind-1' type='result'><bind><jid>u1@srv/res1</jid></bind></iq>",
        )
        .unwrap();
        let iq = Iq::from_element(element).expect("iq should parse");
        assert!(iq.is_result());
        let bound = iq.bound_address.expect("should carry bound address");
        assert_eq!(bound.to_string(), "u1@srv/res1");
    }

    #[test]
    fn parses_error_with_text() {
        let element = Element::parse(
            "<iq id='q1' type='error'><error code='409'><text>conflict</text></error></iq>",
        )
        .unwrap();
        let iq = Iq::from_element(element).unwrap();
        assert!(iq.is_error());
        assert_eq!(iq.error_text.as_deref(), Some("conflict"));
        assert_eq!(
            iq.error.as_ref().and_then(|e| e.attr("code")),
            Some("409")
        );
    }

    #[test]
    fn missing_id_or_type_stays_untyped() {
        assert!(Iq::from_element(Element::parse("<iq type='get'/>").unwrap()).is_none());
        assert!(Iq::from_element(Element::parse("<iq id='q1'/>").unwrap()).is_none());
        assert!(Iq::from_element(Element::parse("<iq id='q1' type='query'/>").unwrap()).is_none());
    }

    #[test]
    fn bind_request_wire_form() {
        let wire = Iq::bind_request("bind-1", "app1-abc").to_wire();
        assert!(wire.contains("type=\"set\""));
        assert!(wire.contains("xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\""));
        assert!(wire.contains("<resource>app1-abc</resource>"));
    }

    #[test]
    fn ping_is_a_get() {
        let element = Iq::ping("ping-3");
        let iq = Iq::from_element(element).unwrap();
        assert_eq!(iq.kind, IqType::Get);
        assert_eq!(iq.unknown.len(), 1);
        assert_eq!(iq.unknown[0].name(), "ping");
    }
}
