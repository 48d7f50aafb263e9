//! Minimal XML element tree for stanzas.

use quick_xml::escape::escape;
use quick_xml::events::BytesStart;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(#[from] quick_xml::Error),

    #[error("invalid UTF-8 in element or attribute name")]
    Utf8(#[from] std::str::Utf8Error),
}

impl From<quick_xml::events::attributes::AttrError> for XmlError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        XmlError::Parse(quick_xml::Error::from(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element with ordered attributes and mixed content.
///
/// Names are kept as written, prefix included (`stream:features`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: set an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder: append a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder: append a text node.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.get_attr("xmlns")
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        match self.children.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(&text),
            _ => self.children.push(Node::Text(text)),
        }
    }

    /// Child elements, skipping text.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element called `name`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    /// First child element called `name` in namespace `ns`.
    pub fn find_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.elements()
            .find(|el| el.name == name && el.namespace() == Some(ns))
    }

    /// Concatenated direct text content.
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Build an element (without children) from a parsed start tag.
    pub fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut element = Element::new(std::str::from_utf8(start.name().as_ref())?);
        for attr in start.attributes() {
            let attr = attr?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr.unescape_value()?.into_owned();
            element.attrs.push((key, value));
        }
        Ok(element)
    }

    /// Serialize to a string.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(xml_chars(value)));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(el) => el.write_into(out),
                Node::Text(text) => out.push_str(&escape(xml_chars(text))),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Characters XML 1.0 cannot carry, such as NUL or ESC, become U+FFFD.
fn xml_chars(s: &str) -> Cow<'_, str> {
    fn allowed(c: char) -> bool {
        matches!(
            c,
            '\t' | '\n' | '\r'
                | '\u{20}'..='\u{D7FF}'
                | '\u{E000}'..='\u{FFFD}'
                | '\u{10000}'..='\u{10FFFF}'
        )
    }
    if s.chars().all(allowed) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.chars()
            .map(|c| if allowed(c) { c } else { char::REPLACEMENT_CHARACTER })
            .collect(),
    )
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_nested() {
        let el = Element::new("iq")
            .attr("type", "set")
            .attr("id", "1")
            .child(Element::new("query").attr("xmlns", "jabber:iq:auth"));
        assert_eq!(
            el.to_xml(),
            "<iq type=\"set\" id=\"1\"><query xmlns=\"jabber:iq:auth\"/></iq>"
        );
    }

    #[test]
    fn test_escaping() {
        let el = Element::new("stdout")
            .attr("note", "a<b & \"c\"")
            .text("1 < 2 & 3 > 2");
        assert_eq!(
            el.to_xml(),
            "<stdout note=\"a&lt;b &amp; &quot;c&quot;\">1 &lt; 2 &amp; 3 &gt; 2</stdout>"
        );
    }

    #[test]
    fn test_disallowed_characters_replaced() {
        let el = Element::new("stdout")
            .attr("note", "bell\u{7}")
            .text("\u{1b}[2Kprogress\u{0}done\ttab\r\n");
        assert_eq!(
            el.to_xml(),
            "<stdout note=\"bell\u{FFFD}\">\u{FFFD}[2Kprogress\u{FFFD}done\ttab\r\n</stdout>"
        );
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = Element::new("iq").attr("id", "1");
        el.set_attr("id", "2");
        assert_eq!(el.get_attr("id"), Some("2"));
        assert_eq!(el.attrs.len(), 1);
    }

    #[test]
    fn test_find_and_text() {
        let el = Element::new("message")
            .child(Element::new("body").text("hello ").text("world"))
            .child(Element::new("x").attr("xmlns", "urn:a"))
            .child(Element::new("x").attr("xmlns", "urn:b"));
        assert_eq!(el.find("body").unwrap().text_content(), "hello world");
        assert_eq!(el.find_ns("x", "urn:b").unwrap().namespace(), Some("urn:b"));
        assert!(el.find("missing").is_none());
    }
}
