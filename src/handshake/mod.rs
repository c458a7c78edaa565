//! The handshake pipe (spec §4.7) — the central protocol state machine.
//!
//! Generalizes the teacher's sequential `xmpp/client.rs` phases (plain
//! open → STARTTLS → SASL → bind, each a blocking read of the next
//! chunk) into a [`Pipe`] driven purely by inbound [`Element`]s, so the
//! same state machine can sit in front of a TCP shim, a WebSocket shim,
//! or a test harness that feeds it canned documents.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{AuthenticationError, ConnectionError, Error, Result, StreamErrorCondition};
use crate::jid::Jid;
use crate::pipeline::{Pipe, PipelineContext};
use crate::scram::{CredentialRetriever, ScramAlgorithm, ScramClient, ScramClientState};
use crate::xml::Element;

pub const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_STREAM_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_CLIENT: &str = "jabber:client";

pub const STREAM_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initialized,
    Started,
    Negotiating,
    Completed,
    StreamClosing,
    StreamClosed,
    Disposed,
}

/// Observable side effects the [`super::session::Session`] layer (or a
/// test harness) polls for after every pipeline read, since a `Pipe`'s
/// hooks cannot themselves suspend to await `deploy_tls()` (spec §5).
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    FeatureNegotiated(String, String),
    TlsDeployRequested,
    Completed(Jid),
    Failed(String),
    StreamClosed,
}

/// What the pipe needs to know about the login identity up front.
pub struct HandshakeConfig {
    pub jid: Jid,
    pub resource: String,
}

pub struct HandshakerPipe {
    config: HandshakeConfig,
    credentials: Box<dyn CredentialRetriever>,
    state: HandshakeState,
    tls_requested: bool,
    authenticated: bool,
    bound: bool,
    scram: Option<ScramClient>,
    negotiated: HashSet<(String, String)>,
    events: Vec<HandshakeEvent>,
    bind_request_id: String,
}

impl HandshakerPipe {
    pub fn new(config: HandshakeConfig, credentials: Box<dyn CredentialRetriever>) -> Self {
        Self {
            config,
            credentials,
            state: HandshakeState::Initialized,
            tls_requested: false,
            authenticated: false,
            bound: false,
            scram: None,
            negotiated: HashSet::new(),
            events: Vec::new(),
            bind_request_id: String::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drains events accumulated since the last call. The pipe itself
    /// never suspends; this is how a caller learns it must now call
    /// `deploy_tls()` or observe the final handshake outcome.
    pub fn take_events(&mut self) -> Vec<HandshakeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Active-close request from the session layer (not triggered by an
    /// inbound element). Idempotent.
    pub fn close_stream(&mut self, ctx: &mut PipelineContext) {
        if matches!(self.state, HandshakeState::StreamClosing | HandshakeState::StreamClosed | HandshakeState::Disposed) {
            return;
        }
        ctx.send(close_element());
        self.state = HandshakeState::StreamClosing;
    }

    /// Called once TLS has been deployed by the external transport layer,
    /// in response to a [`HandshakeEvent::TlsDeployRequested`].
    pub fn tls_deployed(&mut self, ctx: &mut PipelineContext, result: std::result::Result<(), String>) {
        match result {
            Ok(()) => {
                ctx.send(open_element(self.config.jid.domain_part()));
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.state = HandshakeState::StreamClosed;
        self.events.push(HandshakeEvent::Failed(message.into()));
    }

    fn stream_error(&mut self, ctx: &mut PipelineContext, condition: StreamErrorCondition) -> Error {
        ctx.send(stream_error_element(condition));
        ctx.send(close_element());
        self.state = HandshakeState::StreamClosing;
        let err = Error::stream(condition);
        self.events.push(HandshakeEvent::Failed(err.to_string()));
        err
    }

    fn handle_open(&mut self, ctx: &mut PipelineContext, open: &Element) -> Result<()> {
        if self.state == HandshakeState::Completed {
            self.stream_error(ctx, StreamErrorCondition::Conflict);
            return Ok(());
        }
        if open.attr("version") != Some(STREAM_VERSION) {
            return Err(self.stream_error(ctx, StreamErrorCondition::UnsupportedVersion));
        }
        if let Some(from) = open.attr("from") {
            if from != self.config.jid.domain_part() {
                return Err(self.stream_error(ctx, StreamErrorCondition::InvalidFrom));
            }
        }
        self.state = HandshakeState::Negotiating;
        Ok(())
    }

    fn handle_features(&mut self, ctx: &mut PipelineContext, features: &Element) -> Result<()> {
        if !self.tls_requested && features.get_child("starttls", NS_TLS).is_some() {
            self.tls_requested = true;
            ctx.send(starttls_element());
            return Ok(());
        }
        if !self.authenticated && features.get_child("mechanisms", NS_SASL).is_some() {
            return self.begin_sasl(ctx, features);
        }
        if !self.bound && features.get_child("bind", NS_BIND).is_some() {
            self.begin_bind(ctx);
            return Ok(());
        }

        for child in features.children() {
            let sig = child.signature();
            if self.negotiated.insert(sig.clone()) {
                self.events.push(HandshakeEvent::FeatureNegotiated(sig.0, sig.1));
            }
        }

        if self.authenticated && self.bound {
            self.complete();
        }
        Ok(())
    }

    fn begin_sasl(&mut self, ctx: &mut PipelineContext, features: &Element) -> Result<()> {
        let mechanisms = features
            .get_child("mechanisms", NS_SASL)
            .expect("checked by caller");
        let offered: Vec<String> = mechanisms.children().map(|m| m.text()).collect();

        // Prefer the strongest mechanism both sides support.
        let algorithm = [ScramAlgorithm::Sha512, ScramAlgorithm::Sha256, ScramAlgorithm::Sha1]
            .into_iter()
            .find(|algo| offered.iter().any(|m| m == &algo.mechanism_name()))
            .ok_or(Error::Authentication(AuthenticationError::InvalidMechanism))?;

        let mut client = ScramClient::new(algorithm, self.config.jid.local_part());
        let first = client
            .respond(self.credentials.as_ref())
            .map_err(|e| Error::Authentication(scram_client_error_to_authentication(e)))?;
        ctx.send(auth_element(&algorithm.mechanism_name(), &first));
        self.scram = Some(client);
        Ok(())
    }

    fn begin_bind(&mut self, ctx: &mut PipelineContext) {
        self.bind_request_id = Uuid::new_v4().to_string();
        ctx.send(bind_iq(&self.bind_request_id, &self.config.resource));
    }

    fn complete(&mut self) {
        self.state = HandshakeState::Completed;
        self.events
            .push(HandshakeEvent::Completed(self.config.jid.clone()));
    }

    fn handle_sasl_challenge(&mut self, ctx: &mut PipelineContext, challenge_b64: &str) -> Result<()> {
        let client = self
            .scram
            .as_mut()
            .ok_or_else(|| Error::InvalidState("SASL challenge received with no mechanism in progress"))?;
        let challenge = String::from_utf8(
            crate::scram::mechanism::base64_decode(challenge_b64)
                .map_err(|_| Error::Authentication(AuthenticationError::IncorrectEncoding))?,
        )
        .map_err(|_| Error::Authentication(AuthenticationError::IncorrectEncoding))?;

        client
            .accept_challenge(self.credentials.as_ref(), &challenge)
            .map_err(|e| Error::Authentication(scram_client_error_to_authentication(e)))?;
        let next = client
            .respond(self.credentials.as_ref())
            .map_err(|e| Error::Authentication(scram_client_error_to_authentication(e)))?;
        ctx.send(response_element(&next));
        Ok(())
    }

    fn handle_sasl_success(&mut self, ctx: &mut PipelineContext, payload: Option<&str>) -> Result<()> {
        let client = self
            .scram
            .as_mut()
            .ok_or_else(|| Error::InvalidState("SASL success received with no mechanism in progress"))?;
        if client.state() != ScramClientState::SentFinal {
            return Err(Error::InvalidState("SASL success received before client-final was sent"));
        }
        if let Some(payload) = payload {
            let server_final = String::from_utf8(
                crate::scram::mechanism::base64_decode(payload)
                    .map_err(|_| Error::Authentication(AuthenticationError::IncorrectEncoding))?,
            )
            .map_err(|_| Error::Authentication(AuthenticationError::IncorrectEncoding))?;
            client
                .accept_final(&server_final)
                .map_err(|e| Error::Authentication(scram_client_error_to_authentication(e)))?;
        }
        self.authenticated = true;
        self.scram = None;
        ctx.send(open_element(self.config.jid.domain_part()));
        Ok(())
    }

    fn handle_bind_result(&mut self, ctx: &mut PipelineContext, iq: &Element) -> Result<()> {
        let iq_type = iq.attr("type");
        if iq_type == Some("error") {
            self.fail("resource binding failed");
            return Err(Error::InvalidState("resource binding rejected by server"));
        }
        let bind = iq
            .get_child("bind", NS_BIND)
            .ok_or_else(|| self.stream_error(ctx, StreamErrorCondition::InvalidXml))?;
        let jid_text = bind
            .children()
            .find(|c| c.name == "jid")
            .map(|c| c.text())
            .ok_or_else(|| self.stream_error(ctx, StreamErrorCondition::InvalidXml))?;

        let tokens: Vec<&str> = jid_text.split_whitespace().collect();
        let resolved = match tokens.as_slice() {
            [single] => single
                .parse::<Jid>()
                .map_err(|_| self.stream_error(ctx, StreamErrorCondition::InvalidXml))?,
            [first, resource] => {
                if first.to_string() != self.config.jid.to_string() {
                    return Err(self.stream_error(ctx, StreamErrorCondition::InvalidXml));
                }
                self.config.jid.with_resource(*resource)
            }
            _ => return Err(self.stream_error(ctx, StreamErrorCondition::InvalidXml)),
        };

        self.config.jid = resolved;
        self.bound = true;
        if self.authenticated {
            self.complete();
        }
        Ok(())
    }
}

impl Pipe for HandshakerPipe {
    fn name(&self) -> &str {
        "handshaker"
    }

    fn on_added(&mut self, ctx: &mut PipelineContext) {
        self.state = HandshakeState::Started;
        ctx.send(open_element(self.config.jid.domain_part()));
    }

    fn on_removed(&mut self, _ctx: &mut PipelineContext) {
        self.state = HandshakeState::Disposed;
    }

    fn on_read(&mut self, ctx: &mut PipelineContext, element: Element) -> Result<Option<Element>> {
        if matches!(self.state, HandshakeState::StreamClosed | HandshakeState::Disposed) {
            return Ok(None);
        }

        let (ns, name) = (element.namespace.clone().unwrap_or_default(), element.name.clone());

        if ns == NS_FRAMING && name == "close" {
            ctx.send(close_element());
            self.state = HandshakeState::StreamClosed;
            self.events.push(HandshakeEvent::StreamClosed);
            return Ok(None);
        }

        match self.state {
            HandshakeState::Started => {
                if ns == NS_FRAMING && name == "open" {
                    self.handle_open(ctx, &element)?;
                    Ok(None)
                } else {
                    Err(self.stream_error(ctx, StreamErrorCondition::UnsupportedStanzaType))
                }
            }
            HandshakeState::Negotiating => match (ns.as_str(), name.as_str()) {
                (NS_STREAMS, "features") => {
                    self.handle_features(ctx, &element)?;
                    Ok(None)
                }
                (NS_TLS, "proceed") => {
                    self.events.push(HandshakeEvent::TlsDeployRequested);
                    Ok(None)
                }
                (NS_TLS, "failure") => {
                    self.fail("STARTTLS negotiation rejected by the server");
                    Err(Error::Connection(ConnectionError::Tls(
                        "server rejected STARTTLS".to_string(),
                    )))
                }
                (NS_SASL, "challenge") => {
                    self.handle_sasl_challenge(ctx, &element.text())?;
                    Ok(None)
                }
                (NS_SASL, "success") => {
                    let payload = element.text();
                    let payload = if payload.is_empty() { None } else { Some(payload.as_str()) };
                    self.handle_sasl_success(ctx, payload)?;
                    Ok(None)
                }
                (NS_SASL, "failure") => {
                    self.fail("SASL authentication failed");
                    Err(Error::Authentication(AuthenticationError::ClientNotAuthorized(
                        element.first_child().map(|c| c.name.clone()).unwrap_or_default(),
                    )))
                }
                (NS_CLIENT, "iq") if iq_is_bind_response(&element, &self.bind_request_id) => {
                    self.handle_bind_result(ctx, &element)?;
                    Ok(None)
                }
                (NS_CLIENT, "iq") | (NS_CLIENT, "message") | (NS_CLIENT, "presence") => {
                    Err(self.stream_error(ctx, StreamErrorCondition::NotAuthorized))
                }
                _ => Err(self.stream_error(ctx, StreamErrorCondition::UnsupportedStanzaType)),
            },
            HandshakeState::Completed => match (ns.as_str(), name.as_str()) {
                (NS_FRAMING, "open") => {
                    self.stream_error(ctx, StreamErrorCondition::Conflict);
                    Ok(None)
                }
                _ => Ok(Some(element)),
            },
            HandshakeState::StreamClosing => Ok(None),
            _ => Ok(None),
        }
    }

    fn on_write(&mut self, _ctx: &mut PipelineContext, element: Element) -> Result<Option<Element>> {
        Ok(Some(element))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn iq_is_bind_response(iq: &Element, bind_request_id: &str) -> bool {
    !bind_request_id.is_empty() && iq.attr("id") == Some(bind_request_id)
}

fn scram_client_error_to_authentication(e: crate::scram::client::ScramClientError) -> AuthenticationError {
    use crate::scram::client::ScramClientError;
    match e {
        ScramClientError::Authentication(inner) => inner,
        ScramClientError::InvalidState => AuthenticationError::MalformedRequest("SCRAM state machine desynchronized".into()),
        ScramClientError::Mechanism(inner) => AuthenticationError::MalformedRequest(inner.to_string()),
    }
}

fn open_element(to: &str) -> Element {
    Element::builder("open", NS_FRAMING)
        .with_attr("to", to)
        .with_attr("version", STREAM_VERSION)
}

fn close_element() -> Element {
    Element::new("close", Some(NS_FRAMING.to_string()))
}

fn starttls_element() -> Element {
    Element::new("starttls", Some(NS_TLS.to_string()))
}

fn auth_element(mechanism: &str, initial_response: &str) -> Element {
    Element::builder("auth", NS_SASL)
        .with_attr("mechanism", mechanism)
        .with_text(crate::scram::mechanism::base64_encode(initial_response.as_bytes()))
}

fn response_element(data: &str) -> Element {
    Element::new("response", Some(NS_SASL.to_string())).with_text(crate::scram::mechanism::base64_encode(data.as_bytes()))
}

fn bind_iq(id: &str, resource: &str) -> Element {
    let mut bind = Element::new("bind", Some(NS_BIND.to_string()));
    if !resource.is_empty() {
        bind.append_child(Element::new("resource", None).with_text(resource));
    }
    Element::builder("iq", NS_CLIENT)
        .with_attr("type", "set")
        .with_attr("id", id)
        .with_child(bind)
}

fn stream_error_element(condition: StreamErrorCondition) -> Element {
    Element::builder("error", NS_STREAMS)
        .with_child(Element::new(condition.local_name(), Some(NS_STREAM_ERROR.to_string())))
}
