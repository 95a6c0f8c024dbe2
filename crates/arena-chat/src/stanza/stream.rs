use crate::element::Element;

const FRAMING_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-framing";
const SASL_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Server acknowledgement of a stream open (`<open>` or
/// `<stream:stream>`).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub id: Option<String>,
    pub from: Option<String>,
}

impl StreamStart {
    pub fn from_element(element: Element) -> Self {
        StreamStart {
            id: element.attr("id").map(str::to_string),
            from: element.attr("from").map(str::to_string),
        }
    }

    /// Build a client stream open addressed to `domain`.
    pub fn open(domain: &str) -> Element {
        let mut element = Element::with_namespace("open", FRAMING_NAMESPACE);
        element.set_attr("to", domain).set_attr("version", "1.0");
        element
    }
}

/// Advertised stream features after a stream open.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub session: bool,
}

impl Features {
    pub fn from_element(element: Element) -> Self {
        let mechanisms = element
            .child("mechanisms")
            .map(|child| {
                child
                    .children_named("mechanism")
                    .filter_map(Element::text)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Features {
            mechanisms,
            bind: element.has_child("bind"),
            session: element.has_child("session"),
        }
    }

    pub fn supports_plain(&self) -> bool {
        self.mechanisms.iter().any(|m| m.eq_ignore_ascii_case("PLAIN"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSuccess;

impl AuthSuccess {
    pub fn from_element(_element: Element) -> Self {
        AuthSuccess
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthFailure {
    /// The failure condition element name, e.g. `not-authorized`.
    pub condition: Option<String>,
    pub text: Option<String>,
}

impl AuthFailure {
    pub fn from_element(element: Element) -> Self {
        let text = element
            .child("text")
            .and_then(Element::text)
            .map(str::to_string);
        let condition = element
            .children()
            .find(|child| child.name() != "text")
            .map(|child| child.name().to_string());
        AuthFailure { condition, text }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthChallenge {
    /// Base64 challenge payload, verbatim.
    pub payload: Option<String>,
}

impl AuthChallenge {
    pub fn from_element(element: Element) -> Self {
        AuthChallenge {
            payload: element.text().map(str::to_string),
        }
    }
}

/// Build a SASL `<auth>` element carrying an already-encoded payload.
pub fn auth_element(mechanism: &str, payload: &str) -> Element {
    let mut element = Element::with_namespace("auth", SASL_NAMESPACE);
    element.set_attr("mechanism", mechanism);
    element.set_text(payload);
    element
}
