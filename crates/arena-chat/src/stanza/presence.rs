use crate::address::Address;
use crate::element::Element;

/// A typed view over a `<presence>` element.
///
/// Outbound presence is how room subscriptions are requested: addressed
/// to the room, carrying a priority and per-feed opt-outs.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub kind: Option<String>,
    pub priority: Option<i64>,
    /// Whether the initial history feed is requested.
    pub init: bool,
    /// Whether the live update feed is requested.
    pub updates: bool,
    pub unknown: Vec<Element>,
}

impl Presence {
    pub fn from_element(element: Element) -> Option<Self> {
        if !element.name().eq_ignore_ascii_case("presence") {
            return None;
        }

        let mut presence = Presence {
            id: element.attr("id").map(str::to_string),
            from: element.attr_address("from"),
            to: element.attr_address("to"),
            kind: element.attr("type").map(str::to_string),
            priority: None,
            init: true,
            updates: true,
            unknown: Vec::new(),
        };

        for child in element.into_children() {
            match child.name().to_ascii_lowercase().as_str() {
                "priority" => {
                    presence.priority = child.text().and_then(|text| text.trim().parse().ok());
                }
                "subscription" => {
                    presence.init = child.attr("init") != Some("false");
                    presence.updates = child.attr("updates") != Some("false");
                }
                _ => presence.unknown.push(child),
            }
        }

        Some(presence)
    }

    /// Build a subscription request to `target`.
    pub fn subscribe(id: impl Into<String>, target: &Address, priority: i64) -> Self {
        Presence {
            id: Some(id.into()),
            from: None,
            to: Some(target.clone()),
            kind: None,
            priority: Some(priority),
            init: true,
            updates: true,
            unknown: Vec::new(),
        }
    }

    /// Build an unsubscribe request to `target`.
    pub fn unsubscribe(id: impl Into<String>, target: &Address) -> Self {
        Presence {
            id: Some(id.into()),
            from: None,
            to: Some(target.clone()),
            kind: Some("unsubscribe".into()),
            priority: None,
            init: false,
            updates: false,
            unknown: Vec::new(),
        }
    }

    /// Drop the named feed from the request.
    pub fn without_feed(mut self, init: bool, updates: bool) -> Self {
        self.init = init;
        self.updates = updates;
        self
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("presence");
        if let Some(id) = &self.id {
            element.set_attr("id", id);
        }
        if let Some(to) = &self.to {
            element.set_attr("to", to.to_string());
        }
        if let Some(kind) = &self.kind {
            element.set_attr("type", kind);
        }
        if let Some(priority) = self.priority {
            let mut child = Element::new("priority");
            child.set_text(priority.to_string());
            element.append_child(child);
        }
        if !self.init || !self.updates {
            let mut child = Element::new("subscription");
            if !self.init {
                child.set_attr("init", "false");
            }
            if !self.updates {
                child.set_attr("updates", "false");
            }
            element.append_child(child);
        }
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_confirmation() {
        let element =
            Element::parse("<presence id='sub-1' from='team-m1_t1@conf/u1' to='u1@srv/r1'/>")
                .unwrap();
        let presence = Presence::from_element(element).expect("presence should parse");
        assert_eq!(presence.id.as_deref(), Some("sub-1"));
        assert_eq!(presence.from.as_ref().map(|a| a.node()), Some(Some("team-m1_t1")));
        assert!(presence.init);
        assert!(presence.updates);
    }

    #[test]
    fn subscribe_wire_form_carries_priority() {
        let target = Address::parse("match-m1@conf").unwrap();
        let wire = Presence::subscribe("sub-2", &target, 10).to_element().to_wire();
        assert!(wire.contains("to=\"match-m1@conf\""));
        assert!(wire.contains("<priority>10</priority>"));
        assert!(!wire.contains("subscription"));
    }

    #[test]
    fn feed_opt_outs_serialize_as_subscription_child() {
        let target = Address::parse("hub-h1-general@conf").unwrap();
        let presence = Presence::subscribe("sub-3", &target, 1).without_feed(false, true);
        let wire = presence.to_element().to_wire();
        assert!(wire.contains("<subscription init=\"false\"/>"));

        let round = Presence::from_element(Element::parse(&wire).unwrap()).unwrap();
        assert!(!round.init);
        assert!(round.updates);
    }

    #[test]
    fn unsubscribe_sets_type() {
        let target = Address::parse("match-m1@conf").unwrap();
        let wire = Presence::unsubscribe("sub-4", &target).to_element().to_wire();
        assert!(wire.contains("type=\"unsubscribe\""));
    }
}
