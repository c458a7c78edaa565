//! Base plugin (spec §13 supplement) — service discovery, software
//! version, ping, and roster-push acknowledgement.
//!
//! Grounded in the teacher's Phase 7 roster fetch in `xmpp/client.rs`
//! (the only place the teacher speaks the roster wire format) and in
//! XEP-0030/XEP-0092/XEP-0199/RFC 6121 for the four IQ shapes
//! themselves, since the teacher never implements disco/version/ping.

use super::{IqSignature, Plugin, PluginContext};
use crate::xml::Element;

pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
pub const NS_VERSION: &str = "jabber:iq:version";
pub const NS_PING: &str = "urn:xmpp:ping";
pub const NS_ROSTER: &str = "jabber:iq:roster";

/// Identity advertised in `disco#info` responses.
pub struct Identity {
    pub category: &'static str,
    pub kind: &'static str,
    pub name: String,
}

pub struct BasePlugin {
    identity: Identity,
    client_name: String,
    client_version: String,
}

impl Default for BasePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl BasePlugin {
    pub fn new() -> Self {
        Self {
            identity: Identity {
                category: "client",
                kind: "bot",
                name: "xmpp-core".to_string(),
            },
            client_name: "xmpp-core".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    fn disco_info_query(&self) -> Element {
        let identity = Element::new("identity", None)
            .with_attr("category", self.identity.category)
            .with_attr("type", self.identity.kind)
            .with_attr("name", self.identity.name.clone());
        let mut query = Element::builder("query", NS_DISCO_INFO).with_child(identity);
        for feature in self.features() {
            query.append_child(Element::new("feature", None).with_attr("var", feature));
        }
        query
    }
}

impl Plugin for BasePlugin {
    fn name(&self) -> &'static str {
        "base"
    }

    fn features(&self) -> Vec<&'static str> {
        vec![NS_DISCO_INFO, NS_DISCO_ITEMS, NS_VERSION, NS_PING]
    }

    fn iq_signatures(&self) -> Vec<IqSignature> {
        vec![
            (NS_DISCO_INFO.to_string(), "query".to_string()),
            (NS_DISCO_ITEMS.to_string(), "query".to_string()),
            (NS_VERSION.to_string(), "query".to_string()),
            (NS_PING.to_string(), "ping".to_string()),
            (NS_ROSTER.to_string(), "query".to_string()),
        ]
    }

    fn handle_iq(&mut self, ctx: &mut PluginContext, iq: &Element) {
        let Some(first) = iq.first_child() else { return };
        let iq_type = iq.attr("type").unwrap_or("");

        match (first.namespace.as_deref(), first.name.as_str(), iq_type) {
            (Some(NS_DISCO_INFO), "query", "get") => {
                ctx.send_result(iq, Some(self.disco_info_query()));
            }
            (Some(NS_DISCO_ITEMS), "query", "get") => {
                ctx.send_result(iq, Some(Element::builder("query", NS_DISCO_ITEMS)));
            }
            (Some(NS_VERSION), "query", "get") => {
                let query = Element::builder("query", NS_VERSION)
                    .with_child(Element::new("name", None).with_text(self.client_name.clone()))
                    .with_child(Element::new("version", None).with_text(self.client_version.clone()));
                ctx.send_result(iq, Some(query));
            }
            (Some(NS_PING), "ping", "get") => {
                ctx.send_result(iq, None);
            }
            (Some(NS_ROSTER), "query", "set") => {
                // Roster push: RFC 6121 §2.1.6 requires the receiving
                // client to acknowledge with an empty result.
                ctx.send_result(iq, None);
            }
            _ => {}
        }
    }
}

/// Builds the `get` IQ a caller sends through [`super::PluginManager::send_iq`]
/// to fetch the roster — the request side of the teacher's Phase 7 fetch,
/// which the base plugin itself never initiates.
pub fn roster_get_iq(id: impl Into<String>) -> Element {
    Element::builder("iq", "jabber:client")
        .with_attr("type", "get")
        .with_attr("id", id)
        .with_child(Element::builder("query", NS_ROSTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManager;
    use crate::jid::Jid;

    fn manager() -> PluginManager {
        let mut m = PluginManager::new(Jid::parse("user@example.com/phone").unwrap());
        m.apply(Box::new(BasePlugin::new())).unwrap();
        m
    }

    #[test]
    fn disco_info_lists_identity_and_features() {
        let mut m = manager();
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "1")
            .with_child(Element::builder("query", NS_DISCO_INFO));
        let out = m.dispatch_inbound(iq);
        assert_eq!(out.len(), 1);
        let query = out[0].first_child().unwrap();
        assert_eq!(query.name, "query");
        assert!(query.children().any(|c| c.name == "identity"));
        assert!(query.children().any(|c| c.attr("var") == Some(NS_PING)));
    }

    #[test]
    fn ping_is_answered_with_an_empty_result() {
        let mut m = manager();
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "2")
            .with_child(Element::builder("ping", NS_PING));
        let out = m.dispatch_inbound(iq);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr("type"), Some("result"));
        assert!(out[0].has_no_children());
    }

    #[test]
    fn roster_push_is_acknowledged() {
        let mut m = manager();
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "set")
            .with_attr("id", "3")
            .with_child(Element::builder("query", NS_ROSTER));
        let out = m.dispatch_inbound(iq);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr("type"), Some("result"));
    }

    #[test]
    fn version_reports_name_and_version() {
        let mut m = manager();
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "4")
            .with_child(Element::builder("query", NS_VERSION));
        let out = m.dispatch_inbound(iq);
        let query = out[0].first_child().unwrap();
        assert!(query.children().any(|c| c.name == "name"));
        assert!(query.children().any(|c| c.name == "version"));
    }
}
