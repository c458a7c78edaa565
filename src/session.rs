//! Session (spec §4.8) — owns one [`Pipeline`], drives its
//! [`HandshakerPipe`], and exposes a single observable state property.
//!
//! Grounded on the teacher's `XmppClient`/`XmppComponent::connect()`
//! wrapper (a `tokio::spawn`'d run loop behind a channel pair) but
//! generalized: here the "run loop" is the caller feeding inbound
//! documents and reacting to the events this type hands back, since the
//! concrete transport is out of scope (spec §1) and the session itself
//! may not suspend inside a pipeline callback (spec §5).

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handshake::{HandshakeConfig, HandshakeEvent, HandshakeState, HandshakerPipe};
use crate::jid::Jid;
use crate::pipeline::Pipeline;
use crate::plugin::{Plugin, PluginManager};
use crate::scram::CredentialRetriever;
use crate::xml::Element;

const HANDSHAKER_PIPE_NAME: &str = "handshaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Online,
    Disconnecting,
    Disposed,
}

/// Credentials and options passed to [`Session::login`].
pub struct LoginRequest {
    pub jid: Jid,
    pub resource: String,
    pub credentials: Box<dyn CredentialRetriever>,
}

/// Effects the caller (the transport driver) must react to after
/// `feed()`/`login()`/`disconnect()` — mirrors [`HandshakeEvent`] plus
/// session-level transitions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// A framing-level document (`<open>`, `<starttls>`, a SASL
    /// `<auth>`/`<response>`, the bind `<iq>`) the transport must
    /// serialize and write as-is — it has already passed through every
    /// pipe that needed to see it.
    Outbound(Element),
    TlsDeployRequested,
    FeatureNegotiated(String, String),
    Online(Jid),
    Failed(String),
    /// An application-layer stanza that reached the inbound tail of the
    /// pipeline (i.e. survived the handshaker and any plugin dispatch
    /// ahead of it) while the session is ONLINE.
    Stanza(Element),
}

pub struct Session {
    state: SessionState,
    pipeline: Pipeline,
    plugins: PluginManager,
    never_online: bool,
    events: Vec<SessionEvent>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            pipeline: Pipeline::new(),
            plugins: PluginManager::new(Jid::empty()),
            never_online: true,
            events: Vec::new(),
        }
    }

    /// Registers a plugin — see spec §4.9. Plugins may be applied at any
    /// time; they only receive dispatch once the session is ONLINE.
    pub fn apply_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        self.plugins.apply(plugin)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Installs a fresh [`HandshakerPipe`] and transitions
    /// `DISCONNECTED -> CONNECTING -> CONNECTED -> HANDSHAKING`. Illegal
    /// unless currently `DISCONNECTED` (spec §4.8).
    pub fn login(&mut self, request: LoginRequest) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(Error::InvalidState("login() requires state DISCONNECTED"));
        }

        self.pipeline = Pipeline::new();
        let pipe = HandshakerPipe::new(
            HandshakeConfig {
                jid: request.jid,
                resource: request.resource,
            },
            request.credentials,
        );
        let opening = self.pipeline.add_handshaker(Box::new(pipe));
        self.pipeline.start();

        self.set_state(SessionState::Connecting);
        self.set_state(SessionState::Connected);
        self.set_state(SessionState::Handshaking);
        for el in opening {
            self.events.push(SessionEvent::Outbound(el));
        }
        self.drain_handshake_events();
        info!("session login started");
        Ok(())
    }

    /// Feeds one inbound document (already parsed by the transport shim)
    /// through the pipeline.
    pub fn feed(&mut self, document: Element) {
        if let Some(out) = self.pipeline.read(document) {
            if self.state == SessionState::Online {
                for reply in self.plugins.dispatch_inbound(out.clone()) {
                    if let Some(sent) = self.pipeline.write(reply) {
                        self.events.push(SessionEvent::Outbound(sent));
                    }
                }
                self.events.push(SessionEvent::Stanza(out));
            } else {
                debug!("dropping stanza read while not ONLINE: {out}");
            }
        }
        for err in self.pipeline.drain_inbound_exceptions() {
            warn!("inbound pipeline exception: {err}");
            self.events.push(SessionEvent::Failed(err.to_string()));
        }
        self.drain_handshake_events();
    }

    /// Queues an application stanza for sending, running it through the
    /// outbound chain. Returns `None` if some pipe (typically the
    /// handshaker, before COMPLETED) swallowed it.
    pub fn write(&mut self, document: Element) -> Option<Element> {
        let out = self.pipeline.write(document);
        for err in self.pipeline.drain_outbound_exceptions() {
            warn!("outbound pipeline exception: {err}");
            self.events.push(SessionEvent::Failed(err.to_string()));
        }
        out
    }

    /// Call once the external transport has finished (or failed) the
    /// TLS handshake requested via [`SessionEvent::TlsDeployRequested`].
    pub fn tls_deployed(&mut self, result: std::result::Result<(), String>) {
        let restart = self.pipeline.handshaker_tls_deployed(result);
        for el in restart {
            self.events.push(SessionEvent::Outbound(el));
        }
        self.drain_handshake_events();
    }

    /// `DISCONNECTING -> DISCONNECTED`. Illegal from `DISCONNECTED` or
    /// `DISPOSED`.
    pub fn disconnect(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Disconnected | SessionState::Disposed) {
            return Err(Error::InvalidState("disconnect() requires an active session"));
        }
        self.set_state(SessionState::Disconnecting);
        for el in self.pipeline.close_handshaker_stream() {
            self.events.push(SessionEvent::Outbound(el));
        }
        self.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Terminal, one-way transition; tears down the pipeline.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.pipeline.dispose();
        self.plugins.cancel_all();
        self.set_state(SessionState::Disposed);
    }

    /// Sends a stream error through the pipeline and closes the stream.
    /// Illegal unless `state` is one of CONNECTED/HANDSHAKING/ONLINE
    /// (spec §4.8).
    pub fn send_stream_error(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::Connected | SessionState::Handshaking | SessionState::Online
        ) {
            return Err(Error::InvalidState("send_stream_error() requires an active stream"));
        }
        for el in self.pipeline.close_handshaker_stream() {
            self.events.push(SessionEvent::Outbound(el));
        }
        Ok(())
    }

    pub fn handshake_state(&self) -> Option<HandshakeState> {
        self.pipeline.handshaker_state()
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        if state == SessionState::Online {
            self.never_online = false;
        }
        self.events.push(SessionEvent::StateChanged(state));
    }

    fn drain_handshake_events(&mut self) {
        for event in self.pipeline.take_handshaker_events() {
            match event {
                HandshakeEvent::TlsDeployRequested => self.events.push(SessionEvent::TlsDeployRequested),
                HandshakeEvent::FeatureNegotiated(ns, name) => {
                    self.events.push(SessionEvent::FeatureNegotiated(ns, name))
                }
                HandshakeEvent::Completed(jid) => {
                    self.plugins.set_local_jid(jid.clone());
                    self.set_state(SessionState::Online);
                    self.events.push(SessionEvent::Online(jid));
                }
                HandshakeEvent::Failed(message) => {
                    self.events.push(SessionEvent::Failed(message));
                    self.set_state(SessionState::Disconnected);
                }
                HandshakeEvent::StreamClosed => {
                    self.set_state(SessionState::Disconnected);
                }
            }
        }
    }
}

/// Narrow helpers so [`Session`] never has to downcast or build a
/// [`crate::pipeline::PipelineContext`] by hand; they own the one place
/// that knows the handshaker lives under [`HANDSHAKER_PIPE_NAME`].
impl Pipeline {
    fn add_handshaker(&mut self, pipe: Box<HandshakerPipe>) -> Vec<Element> {
        self.add_at_outbound_end(HANDSHAKER_PIPE_NAME, pipe)
    }

    fn with_handshaker_mut<R>(&mut self, f: impl FnOnce(&mut HandshakerPipe, &mut crate::pipeline::PipelineContext) -> R) -> (Option<R>, Vec<Element>) {
        let mut out = Vec::new();
        let mut inn = Vec::new();
        let result = {
            let mut ctx = crate::pipeline::PipelineContext {
                injected_outbound: &mut out,
                injected_inbound: &mut inn,
            };
            self.get_mut(HANDSHAKER_PIPE_NAME)
                .and_then(|p| p.as_any_mut().downcast_mut::<HandshakerPipe>())
                .map(|h| f(h, &mut ctx))
        };
        (result, out)
    }

    fn handshaker_tls_deployed(&mut self, result: std::result::Result<(), String>) -> Vec<Element> {
        self.with_handshaker_mut(|h, ctx| h.tls_deployed(ctx, result)).1
    }

    fn close_handshaker_stream(&mut self) -> Vec<Element> {
        self.with_handshaker_mut(|h, ctx| h.close_stream(ctx)).1
    }

    fn take_handshaker_events(&mut self) -> Vec<HandshakeEvent> {
        self.with_handshaker_mut(|h, _ctx| h.take_events()).0.unwrap_or_default()
    }

    fn handshaker_state(&self) -> Option<HandshakeState> {
        self.get(HANDSHAKER_PIPE_NAME)
            .and_then(|p| p.as_any().downcast_ref::<HandshakerPipe>())
            .map(|h| h.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scram::PasswordRetriever;

    fn login_request() -> LoginRequest {
        LoginRequest {
            jid: Jid::parse("user@example.com").unwrap(),
            resource: String::new(),
            credentials: Box::new(PasswordRetriever("pencil".to_string())),
        }
    }

    #[test]
    fn login_requires_disconnected_state() {
        let mut session = Session::new();
        session.login(login_request()).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(matches!(
            session.login(login_request()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn login_emits_the_initial_open() {
        let mut session = Session::new();
        session.login(login_request()).unwrap();
        let events = session.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Outbound(el) if el.name == "open"
        )));
    }

    #[test]
    fn disconnect_requires_an_active_session() {
        let mut session = Session::new();
        assert!(matches!(session.disconnect(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn dispose_is_terminal_and_idempotent() {
        let mut session = Session::new();
        session.login(login_request()).unwrap();
        session.dispose();
        assert_eq!(session.state(), SessionState::Disposed);
        session.dispose();
        assert_eq!(session.state(), SessionState::Disposed);
    }
}
