//! Plugin manager (spec §4.9, C9) — dispatches inbound IQ stanzas to
//! registered plugins by `(namespace, local-name)` signature.
//!
//! Generalizes the teacher's `XmppCommand`/`XmppEvent` channel dispatch
//! in `xmpp/component.rs` (a flat match over a handful of hardcoded
//! stanza kinds) into a signature-keyed fan-out table any number of
//! plugins can register into.

pub mod base;

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, StanzaErrorCondition, StanzaErrorType};
use crate::jid::Jid;
use crate::xml::Element;

pub type IqSignature = (String, String);

/// Handed to a [`Plugin`] on every call so it can emit stanzas without
/// owning the transport itself.
pub struct PluginContext<'a> {
    local_jid: &'a Jid,
    outbound: &'a mut Vec<Element>,
}

impl<'a> PluginContext<'a> {
    pub fn local_jid(&self) -> &Jid {
        self.local_jid
    }

    pub fn send_stanza(&mut self, stanza: Element) {
        self.outbound.push(stanza);
    }

    /// Answers an inbound IQ with a `result`, copying its `id`.
    pub fn send_result(&mut self, request: &Element, payload: Option<Element>) {
        let mut iq = Element::builder("iq", request.namespace.clone().unwrap_or_default())
            .with_attr("type", "result");
        if let Some(id) = request.attr("id") {
            iq.set_attr("id", id);
        }
        if let Some(payload) = payload {
            iq.append_child(payload);
        }
        self.outbound.push(iq);
    }

    /// Answers an inbound IQ with a typed stanza error.
    pub fn send_error(&mut self, request: &Element, kind: StanzaErrorType, condition: StanzaErrorCondition) {
        self.outbound.push(error_iq(request, kind, condition));
    }
}

/// A protocol extension dispatched to by `(namespace, local-name)`
/// signature. All hooks default to no-ops so a minimal plugin only
/// implements `handle_iq`.
pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    /// Other plugin names this one requires to already be applied.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Service-discovery feature strings this plugin advertises.
    fn features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// `(namespace, local-name)` pairs this plugin wants to see.
    fn iq_signatures(&self) -> Vec<IqSignature>;

    fn on_apply(&mut self, _ctx: &mut PluginContext) {}

    fn on_remove(&mut self, _ctx: &mut PluginContext) {}

    /// Handles one matching inbound IQ. A plugin may answer directly via
    /// `ctx.send_result`/`ctx.send_error`, or return `None` to leave it
    /// unanswered (e.g. a silent roster-push acknowledgement already
    /// sent through `ctx`).
    fn handle_iq(&mut self, ctx: &mut PluginContext, iq: &Element);
}

struct Correlator {
    sender: oneshot::Sender<std::result::Result<Element, Error>>,
}

/// Owns the set of applied plugins and the outstanding `send_iq`
/// correlators for one session.
pub struct PluginManager {
    local_jid: Jid,
    plugins: Vec<Box<dyn Plugin>>,
    applied: HashSet<&'static str>,
    pending: HashMap<String, Correlator>,
}

impl PluginManager {
    pub fn new(local_jid: Jid) -> Self {
        Self {
            local_jid,
            plugins: Vec::new(),
            applied: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn set_local_jid(&mut self, jid: Jid) {
        self.local_jid = jid;
    }

    /// Registers `plugin`, recursing into its declared dependencies —
    /// here, requiring they already be applied, since this crate has no
    /// type registry to construct an unknown plugin type by name.
    pub fn apply(&mut self, mut plugin: Box<dyn Plugin>) -> crate::error::Result<()> {
        for dep in plugin.dependencies() {
            if !self.applied.contains(dep) {
                return Err(Error::InvalidState("plugin dependency not yet applied"));
            }
        }
        let mut outbound = Vec::new();
        let mut ctx = PluginContext {
            local_jid: &self.local_jid,
            outbound: &mut outbound,
        };
        plugin.on_apply(&mut ctx);
        self.applied.insert(plugin.name());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(pos) = self.plugins.iter().position(|p| p.name() == name) {
            let mut plugin = self.plugins.remove(pos);
            let mut outbound = Vec::new();
            let mut ctx = PluginContext {
                local_jid: &self.local_jid,
                outbound: &mut outbound,
            };
            plugin.on_remove(&mut ctx);
            self.applied.remove(name);
        }
    }

    /// Routes one inbound stanza. Non-IQ stanzas and IQs that resolve a
    /// pending `send_iq` correlator produce no direct output; IQs that
    /// match one or more plugins' signatures are fanned out to each;
    /// unmatched `get`/`set` IQs get a synthesized `service-unavailable`.
    pub fn dispatch_inbound(&mut self, stanza: Element) -> Vec<Element> {
        if stanza.name != "iq" {
            return Vec::new();
        }

        let iq_type = stanza.attr("type").unwrap_or("").to_string();
        if let Some(id) = stanza.attr("id") {
            if matches!(iq_type.as_str(), "result" | "error") {
                if let Some(correlator) = self.pending.remove(id) {
                    let outcome = if iq_type == "error" {
                        Err(Error::stanza(StanzaErrorType::Cancel, error_condition_of(&stanza)))
                    } else {
                        Ok(stanza)
                    };
                    let _ = correlator.sender.send(outcome);
                    return Vec::new();
                }
            }
        }

        let Some(first) = stanza.first_child() else {
            return Vec::new();
        };
        let signature = first.signature();

        let mut outbound = Vec::new();
        let mut matched = false;
        for plugin in self.plugins.iter_mut() {
            if plugin.iq_signatures().contains(&signature) {
                matched = true;
                let mut ctx = PluginContext {
                    local_jid: &self.local_jid,
                    outbound: &mut outbound,
                };
                plugin.handle_iq(&mut ctx, &stanza);
            }
        }

        if !matched && matches!(iq_type.as_str(), "get" | "set") {
            debug!(ns = %signature.0, name = %signature.1, "no plugin matched IQ, replying service-unavailable");
            outbound.push(error_iq(&stanza, StanzaErrorType::Cancel, StanzaErrorCondition::ServiceUnavailable));
        }
        outbound
    }

    /// Sends a request-bearing IQ, registering a one-shot correlator on
    /// its `id`. Returns the element to hand to the transport plus a
    /// receiver that resolves with the first matching `result`/`error`
    /// response. Must not be awaited from inside a pipeline callback
    /// (spec §5) — only from the caller's own async context.
    pub fn send_iq(&mut self, iq: Element) -> crate::error::Result<(Element, oneshot::Receiver<std::result::Result<Element, Error>>)> {
        let id = iq.attr("id").unwrap_or("").to_string();
        let iq_type = iq.attr("type").unwrap_or("");
        if id.is_empty() || !matches!(iq_type, "get" | "set") {
            return Err(Error::InvalidState("send_iq requires a non-empty id and type get/set"));
        }
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, Correlator { sender });
        Ok((iq, receiver))
    }

    /// Drops every outstanding correlator, signalling cancellation to
    /// their receivers (dropping the sender yields `RecvError`).
    pub fn cancel_all(&mut self) {
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "cancelling outstanding send_iq correlators");
        }
        self.pending.clear();
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

fn error_iq(request: &Element, kind: StanzaErrorType, condition: StanzaErrorCondition) -> Element {
    let type_attr = match kind {
        StanzaErrorType::Cancel => "cancel",
        StanzaErrorType::Continue => "continue",
        StanzaErrorType::Modify => "modify",
        StanzaErrorType::Auth => "auth",
        StanzaErrorType::Wait => "wait",
    };
    let error = Element::new("error", None)
        .with_attr("type", type_attr)
        .with_child(Element::new(
            condition.local_name(),
            Some("urn:ietf:params:xml:ns:xmpp-stanzas".to_string()),
        ));
    let mut iq = Element::builder("iq", request.namespace.clone().unwrap_or_default())
        .with_attr("type", "error")
        .with_child(error);
    if let Some(id) = request.attr("id") {
        iq.set_attr("id", id);
    }
    iq
}

fn error_condition_of(_stanza: &Element) -> StanzaErrorCondition {
    // The closed condition set this crate models doesn't cover every
    // wire condition a peer might send back; callers that need the
    // exact RFC 6120 name should inspect the raw element themselves.
    StanzaErrorCondition::BadRequest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::base::BasePlugin;

    fn jid() -> Jid {
        Jid::parse("user@example.com/phone").unwrap()
    }

    #[test]
    fn unmatched_get_iq_gets_service_unavailable() {
        let mut manager = PluginManager::new(jid());
        manager.apply(Box::new(BasePlugin::new())).unwrap();

        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "42")
            .with_child(Element::builder("foo", "urn:x-test"));

        let out = manager.dispatch_inbound(iq);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attr("type"), Some("error"));
        assert!(out[0].get_child("error", "").is_none());
        let error = out[0].first_child().unwrap();
        assert_eq!(error.name, "error");
        assert_eq!(error.attr("type"), Some("cancel"));
    }

    #[test]
    fn send_iq_requires_nonempty_id_and_request_type() {
        let mut manager = PluginManager::new(jid());
        let iq = Element::builder("iq", "jabber:client").with_attr("type", "get");
        assert!(manager.send_iq(iq).is_err());
    }

    #[test]
    fn send_iq_resolves_on_matching_result() {
        let mut manager = PluginManager::new(jid());
        let iq = Element::builder("iq", "jabber:client")
            .with_attr("type", "get")
            .with_attr("id", "r1");
        let (_sent, mut receiver) = manager.send_iq(iq).unwrap();

        let result = Element::builder("iq", "jabber:client")
            .with_attr("type", "result")
            .with_attr("id", "r1");
        let out = manager.dispatch_inbound(result);
        assert!(out.is_empty());
        assert!(receiver.try_recv().unwrap().is_ok());
    }

    #[test]
    fn dependency_not_applied_is_rejected() {
        struct Dependent;
        impl Plugin for Dependent {
            fn name(&self) -> &'static str {
                "dependent"
            }
            fn dependencies(&self) -> Vec<&'static str> {
                vec!["base"]
            }
            fn iq_signatures(&self) -> Vec<IqSignature> {
                Vec::new()
            }
            fn handle_iq(&mut self, _ctx: &mut PluginContext, _iq: &Element) {}
        }

        let mut manager = PluginManager::new(jid());
        assert!(manager.apply(Box::new(Dependent)).is_err());
    }
}
