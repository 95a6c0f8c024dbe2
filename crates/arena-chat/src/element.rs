use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

use crate::address::Address;

/// A generic wire-tree node: tag name, optional namespace, ordered
/// attributes, child elements and character data.
///
/// The tree is traversed top-down only; nodes carry no parent links and
/// are owned exclusively by whichever stanza wraps them. All parsing is
/// lenient: malformed input degrades to `None`, never a panic or error.
#[derive(Debug, Clone)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut element = Self::new(name);
        element.namespace = Some(namespace.into());
        element
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(text.into());
        self
    }

    /// Raw attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set an attribute, replacing in place to preserve insertion order.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
        self
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Integer coercion; bad input yields `None`.
    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(|value| value.trim().parse().ok())
    }

    /// Timestamp coercion: epoch milliseconds first, RFC 3339 as a
    /// fallback; bad input yields `None`.
    pub fn attr_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        let value = self.attr(name)?.trim();
        if let Ok(millis) = value.parse::<i64>() {
            return Utc.timestamp_millis_opt(millis).single();
        }
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Enum-ish coercion through `FromStr`; bad input yields `None`.
    pub fn attr_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.attr(name).and_then(|value| value.parse().ok())
    }

    /// Address coercion; bad input yields `None`.
    pub fn attr_address(&self, name: &str) -> Option<Address> {
        self.attr(name).and_then(|value| Address::parse(value).ok())
    }

    pub fn append_child(&mut self, child: Element) -> &mut Self {
        self.children.push(child);
        self
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter()
    }

    pub fn into_children(self) -> Vec<Element> {
        self.children
    }

    /// First child with the given tag name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// Serialize to wire text. Self-closing when the node carries
    /// neither children nor text; the namespace is emitted as a bare
    /// `xmlns` only when present.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        if let Some(namespace) = &self.namespace {
            out.push_str(" xmlns=\"");
            out.push_str(&escape(namespace));
            out.push('"');
        }
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }

        if self.children.is_empty() && self.text.is_none() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&escape(text));
        }
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse one top-level element from wire text; malformed input
    /// yields `None`.
    pub fn parse(raw: &str) -> Option<Element> {
        let mut parser = Parser {
            input: raw.trim().as_bytes(),
            position: 0,
        };
        parser.skip_prolog();
        let element = parser.parse_element()?;
        parser.skip_whitespace();
        if parser.position != parser.input.len() {
            // trailing garbage after the top-level element
            return None;
        }
        Some(element)
    }
}

/// Attribute order is a serialization detail; equality is structural.
impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.namespace != other.namespace
            || self.text != other.text
            || self.attributes.len() != other.attributes.len()
            || self.children != other.children
        {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, value)| other.attr(key) == Some(value.as_str()))
    }
}

impl Eq for Element {}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for character in raw.chars() {
        match character {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            // dangling entity, keep literally
            out.push_str(tail);
            return out;
        };
        match &tail[..=end] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            unknown => out.push_str(unknown),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

struct Parser<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.position += 1;
        }
    }

    fn skip_prolog(&mut self) {
        self.skip_whitespace();
        while self.input[self.position..].starts_with(b"<?")
            || self.input[self.position..].starts_with(b"<!--")
        {
            let close: &[u8] = if self.input[self.position..].starts_with(b"<?") {
                b"?>"
            } else {
                b"-->"
            };
            match find_from(self.input, self.position, close) {
                Some(index) => self.position = index + close.len(),
                None => {
                    self.position = self.input.len();
                    return;
                }
            }
            self.skip_whitespace();
        }
    }

    fn parse_element(&mut self) -> Option<Element> {
        if self.peek() != Some(b'<') {
            return None;
        }
        self.position += 1;

        let name = self.parse_name()?;
        let mut element = Element::new(name.clone());

        loop {
            self.skip_whitespace();
            match self.peek()? {
                b'/' => {
                    // self-closing
                    self.position += 1;
                    if self.peek() != Some(b'>') {
                        return None;
                    }
                    self.position += 1;
                    return Some(element);
                }
                b'>' => {
                    self.position += 1;
                    break;
                }
                _ => {
                    let (key, value) = self.parse_attribute()?;
                    if key == "xmlns" {
                        element.namespace = Some(value);
                    } else {
                        element.attributes.push((key, value));
                    }
                }
            }
        }

        // content: character data interleaved with child elements
        let mut text = String::new();
        loop {
            match self.peek()? {
                b'<' => {
                    if self.input[self.position..].starts_with(b"</") {
                        self.position += 2;
                        let closing = self.parse_name()?;
                        self.skip_whitespace();
                        if self.peek() != Some(b'>') || closing != name {
                            return None;
                        }
                        self.position += 1;
                        if !text.is_empty() {
                            element.text = Some(unescape(&text));
                        }
                        return Some(element);
                    }
                    if self.input[self.position..].starts_with(b"<!--") {
                        let index = find_from(self.input, self.position, b"-->")?;
                        self.position = index + 3;
                        continue;
                    }
                    let child = self.parse_element()?;
                    element.children.push(child);
                }
                _ => {
                    let start = self.position;
                    while !matches!(self.peek(), Some(b'<') | None) {
                        self.position += 1;
                    }
                    text.push_str(std::str::from_utf8(&self.input[start..self.position]).ok()?);
                }
            }
        }
    }

    fn parse_name(&mut self) -> Option<String> {
        let start = self.position;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b':') {
                self.position += 1;
            } else {
                break;
            }
        }
        if self.position == start {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.position])
            .ok()
            .map(str::to_string)
    }

    fn parse_attribute(&mut self) -> Option<(String, String)> {
        let key = self.parse_name()?;
        self.skip_whitespace();
        if self.peek() != Some(b'=') {
            return None;
        }
        self.position += 1;
        self.skip_whitespace();
        let quote = self.peek()?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        self.position += 1;
        let start = self.position;
        while self.peek() != Some(quote) {
            self.peek()?;
            self.position += 1;
        }
        let value = std::str::from_utf8(&self.input[start..self.position]).ok()?;
        self.position += 1;
        Some((key, unescape(value)))
    }
}

fn find_from(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}
