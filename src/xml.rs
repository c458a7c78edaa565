//! The structured document tree carried through the pipeline.
//!
//! The core never parses or serializes raw XML bytes itself (that is the
//! transport shim's job, per §6); it only ever handles [`Element`] trees
//! that a shim has already parsed, or that the core itself builds to hand
//! back to the shim for serialization. This module provides that tree and
//! the small set of query helpers the handshake and plugin layers need.

use std::fmt;

/// One XML element: a qualified name, attributes, and ordered children
/// (sub-elements interleaved with text runs).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

/// A child of an [`Element`]: either a nested element or a text run.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<Option<String>>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn builder(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(name, Some(namespace.into()))
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.attrs.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.attrs.push((key, value));
        }
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Matches `(namespace, local-name)` against this element.
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// First child element, regardless of name/namespace.
    pub fn first_child(&self) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element matching `(namespace, local-name)`.
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Element(e) if e.is(namespace, name) => Some(e),
            _ => None,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn has_no_children(&self) -> bool {
        self.children.is_empty()
    }

    /// Concatenation of every direct text-node child.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// The `(namespace, local-name)` pair this element identifies itself
    /// with — the key used by [`crate::plugin::IqSignature`] and by the
    /// handshake feature-recognition table.
    pub fn signature(&self) -> (String, String) {
        (
            self.namespace.clone().unwrap_or_default(),
            self.name.clone(),
        )
    }
}

impl fmt::Display for Element {
    /// A minimal, deterministic serialization — sufficient for logging and
    /// for the in-process demo transport. A production transport shim
    /// would use a real XML writer (e.g. `quick-xml`) instead.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        if let Some(ns) = &self.namespace {
            write!(f, " xmlns='{ns}'")?;
        }
        for (k, v) in &self.attrs {
            write!(f, " {k}='{}'", escape_attr(v))?;
        }
        if self.children.is_empty() {
            write!(f, "/>")
        } else {
            write!(f, ">")?;
            for child in &self.children {
                match child {
                    Node::Element(e) => write!(f, "{e}")?,
                    Node::Text(t) => write!(f, "{}", escape_text(t))?,
                }
            }
            write!(f, "</{}>", self.name)
        }
    }
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('\'', "&apos;").replace('<', "&lt;")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_namespace_and_name() {
        let el = Element::builder("query", "http://jabber.org/protocol/disco#info");
        assert!(el.is("http://jabber.org/protocol/disco#info", "query"));
        assert_eq!(
            el.signature(),
            (
                "http://jabber.org/protocol/disco#info".to_string(),
                "query".to_string()
            )
        );
    }

    #[test]
    fn get_child_finds_by_namespace_and_name() {
        let bind = Element::builder("bind", "urn:ietf:params:xml:ns:xmpp-bind")
            .with_child(Element::new("resource", None).with_text("phone"));
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "set")
            .with_child(bind);

        let bind_child = iq
            .get_child("bind", "urn:ietf:params:xml:ns:xmpp-bind")
            .unwrap();
        assert_eq!(
            bind_child.get_child("resource", "").map(|_| ()),
            None,
            "resource has no namespace of its own"
        );
        assert_eq!(bind_child.first_child().unwrap().text(), "phone");
    }

    #[test]
    fn display_round_trips_attrs_and_text() {
        let el = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "1")
            .with_child(Element::builder("ping", "urn:xmpp:ping"));
        let rendered = el.to_string();
        assert!(rendered.starts_with("<iq"));
        assert!(rendered.contains("type='get'"));
        assert!(rendered.ends_with("</iq>"));
    }
}
