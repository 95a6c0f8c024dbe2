use chrono::{DateTime, Utc};

use crate::address::Address;
use crate::element::Element;

/// Archival metadata attached by the server to delivered messages.
/// Carries the durable resource id, the acting user and the server
/// receipt time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Archived {
    pub id: Option<String>,
    pub by: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A `<data>` payload. The `kind` discriminates room notices such as
/// member joins and message deletions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPayload {
    pub kind: Option<String>,
    pub user: Option<String>,
    pub target_id: Option<String>,
    pub by: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceKind {
    Mention,
    MentionEveryone,
    MentionHere,
    Image,
    Other(String),
}

/// A `<reference>` payload: a mention of a user (or a broadcast scope)
/// or an attached image.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub user: Option<String>,
    pub uri: Option<String>,
}

/// A `<read>` receipt marker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadMarker {
    pub message_id: Option<String>,
}

/// A typed view over a `<message>` element. Children are classified
/// into dedicated buckets; anything unrecognized is retained in
/// `unknown` rather than dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub kind: Option<String>,
    /// Explicit sender-side stamp, when present.
    pub stamp: Option<DateTime<Utc>>,
    pub bodies: Vec<String>,
    pub data: Vec<DataPayload>,
    pub archived: Option<Archived>,
    pub references: Vec<Reference>,
    pub composing: bool,
    pub read: Option<ReadMarker>,
    /// Extension payloads (`<x>` children).
    pub extras: Vec<Element>,
    pub unknown: Vec<Element>,
}

impl Message {
    pub fn from_element(element: Element) -> Option<Self> {
        if !element.name().eq_ignore_ascii_case("message") {
            return None;
        }

        let mut message = Message {
            id: element.attr("id").map(str::to_string),
            from: element.attr_address("from"),
            to: element.attr_address("to"),
            kind: element.attr("type").map(str::to_string),
            stamp: element.attr_timestamp("stamp"),
            bodies: Vec::new(),
            data: Vec::new(),
            archived: None,
            references: Vec::new(),
            composing: false,
            read: None,
            extras: Vec::new(),
            unknown: Vec::new(),
        };

        for child in element.into_children() {
            match child.name().to_ascii_lowercase().as_str() {
                "body" => {
                    message
                        .bodies
                        .push(child.text().unwrap_or_default().to_string());
                }
                "data" => message.data.push(DataPayload {
                    kind: child.attr("type").map(str::to_string),
                    user: child.attr("user").map(str::to_string),
                    target_id: child.attr("id").map(str::to_string),
                    by: child.attr("by").map(str::to_string),
                    timestamp: child.attr_timestamp("timestamp"),
                }),
                "archived" => {
                    message.archived = Some(Archived {
                        id: child.attr("id").map(str::to_string),
                        by: child.attr("by").map(str::to_string),
                        timestamp: child.attr_timestamp("timestamp"),
                    });
                }
                "reference" => {
                    let kind = match (child.attr("type"), child.attr("scope")) {
                        (Some("mention"), Some("everyone")) => ReferenceKind::MentionEveryone,
                        (Some("mention"), Some("here")) => ReferenceKind::MentionHere,
                        (Some("mention"), _) => ReferenceKind::Mention,
                        (Some("image"), _) => ReferenceKind::Image,
                        (other, _) => ReferenceKind::Other(other.unwrap_or_default().to_string()),
                    };
                    message.references.push(Reference {
                        kind,
                        user: child.attr("user").map(str::to_string),
                        uri: child.attr("uri").map(str::to_string),
                    });
                }
                "composing" => message.composing = true,
                "read" => {
                    message.read = Some(ReadMarker {
                        message_id: child.attr("id").map(str::to_string),
                    });
                }
                "x" => message.extras.push(child),
                _ => message.unknown.push(child),
            }
        }

        Some(message)
    }

    /// All body chunks joined; `None` when the message carries no body.
    pub fn body(&self) -> Option<String> {
        if self.bodies.is_empty() {
            return None;
        }
        Some(self.bodies.join("\n"))
    }

    /// The durable resource id: archival id when present, envelope id
    /// otherwise.
    pub fn resource_id(&self) -> Option<&str> {
        self.archived
            .as_ref()
            .and_then(|archived| archived.id.as_deref())
            .or(self.id.as_deref())
    }

    /// User ids announced as joining via `<data type="join">` payloads.
    pub fn joins(&self) -> impl Iterator<Item = &str> {
        self.data
            .iter()
            .filter(|payload| payload.kind.as_deref() == Some("join"))
            .filter_map(|payload| payload.user.as_deref())
    }

    /// Ids of messages deleted via `<data type="delete">` payloads.
    pub fn deletions(&self) -> impl Iterator<Item = &str> {
        self.data
            .iter()
            .filter(|payload| payload.kind.as_deref() == Some("delete"))
            .filter_map(|payload| payload.target_id.as_deref())
    }

    /// The extension payload carrying an `editing` marker, if any.
    pub fn edit_marker(&self) -> Option<&Element> {
        self.extras
            .iter()
            .find(|extra| extra.attr("editing").is_some())
    }

    /// Bare from == bare to marks a read receipt conversation echo.
    pub fn is_receipt_echo(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => from.without_resource() == to.without_resource(),
            _ => false,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("message");
        if let Some(id) = &self.id {
            element.set_attr("id", id);
        }
        if let Some(from) = &self.from {
            element.set_attr("from", from.to_string());
        }
        if let Some(to) = &self.to {
            element.set_attr("to", to.to_string());
        }
        if let Some(kind) = &self.kind {
            element.set_attr("type", kind);
        }
        if let Some(stamp) = &self.stamp {
            element.set_attr("stamp", stamp.timestamp_millis().to_string());
        }
        for body in &self.bodies {
            let mut child = Element::new("body");
            child.set_text(body);
            element.append_child(child);
        }
        if self.composing {
            element.append_child(Element::new("composing"));
        }
        for extra in &self.extras {
            element.append_child(extra.clone());
        }
        for raw in &self.unknown {
            element.append_child(raw.clone());
        }
        element
    }
}
