//! Worked example wiring [`xmpp_core::Session`] to a real TCP/StartTLS
//! transport. Grounded in the teacher's `main.rs` reconnect loop and the
//! phase-numbered `run()` in `xmpp/client.rs` — this binary is the
//! transport shim the core explicitly leaves out of scope (spec §1);
//! XML framing of the wire byte stream into [`xmpp_core::session`]'s
//! `Element` trees is illustrative, not part of the crate's public API.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xmpp_core::backoff::Backoff;
use xmpp_core::config::{Credentials, LoginConfig};
use xmpp_core::discovery::{self, ConnectionCandidate, TcpTls};
use xmpp_core::session::{LoginRequest, Session, SessionEvent, SessionState};
use xmpp_core::xml::Element;

const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 20;
const STREAM_NS: &str = "http://etherx.jabber.org/streams";
const CLIENT_NS: &str = "jabber:client";

/// Either side of a StartTLS upgrade; the demo always re-opens the
/// stream in plaintext first, so both variants speak the same framing.
enum Wire {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Wire {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Wire::Plain(s) => s.write_all(bytes).await,
            Wire::Tls(s) => s.write_all(bytes).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Wire::Plain(s) => s.read(buf).await,
            Wire::Tls(s) => s.read(buf).await,
        }
    }
}

/// Incrementally turns raw XML bytes off the wire into [`Element`]s,
/// synthesizing a framing `<open>`/`<close>` for the long-lived
/// `<stream:stream>` root the way RFC 7395 does for WebSocket — this is
/// the form [`xmpp_core::handshake::HandshakerPipe`] expects.
#[derive(Default)]
struct Framer {
    buf: Vec<u8>,
    depth: usize,
    stack: Vec<Element>,
    seen_stream_open: bool,
}

impl Framer {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Element> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            // Snapshot into an owned buffer so the reader's borrowed
            // `Event`s don't alias `self.buf` while `apply_event` needs
            // `&mut self` to mutate the element stack.
            let snapshot = String::from_utf8_lossy(&self.buf).into_owned();
            let mut reader = quick_xml::Reader::from_str(&snapshot);
            reader.config_mut().trim_text(true);
            let mut consumed = 0usize;
            let mut progressed = false;

            loop {
                let pos_before = reader.buffer_position() as usize;
                match reader.read_event() {
                    Ok(quick_xml::events::Event::Eof) => break,
                    Ok(event) => {
                        consumed = reader.buffer_position() as usize;
                        progressed = true;
                        if let Some(el) = self.apply_event(event) {
                            out.push(el);
                        }
                    }
                    Err(_) => {
                        consumed = pos_before;
                        break;
                    }
                }
            }

            self.buf.drain(..consumed);
            if !progressed || self.buf.is_empty() {
                break;
            }
        }
        out
    }

    fn apply_event(&mut self, event: quick_xml::events::Event<'_>) -> Option<Element> {
        use quick_xml::events::Event;
        match event {
            Event::Start(e) => {
                let (namespace, local) = resolve_name(&e, self.stack.last());
                if self.stack.is_empty() && local == "stream" {
                    self.seen_stream_open = true;
                    return Some(Element::builder("open", "urn:ietf:params:xml:ns:xmpp-framing")
                        .with_attr("from", attr(&e, "from").unwrap_or_default())
                        .with_attr("version", attr(&e, "version").unwrap_or_default()));
                }
                let mut el = Element::new(local, Some(namespace));
                for a in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
                    if key == "xmlns" || key.starts_with("xmlns:") {
                        continue;
                    }
                    let value = a.unescape_value().unwrap_or_default().to_string();
                    el.set_attr(key, value);
                }
                self.stack.push(el);
                self.depth += 1;
                None
            }
            Event::End(_) => {
                if self.depth == 0 {
                    // `</stream:stream>`
                    return Some(Element::new("close", Some("urn:ietf:params:xml:ns:xmpp-framing".to_string())));
                }
                self.depth -= 1;
                let finished = self.stack.pop()?;
                if let Some(parent) = self.stack.last_mut() {
                    parent.append_child(finished);
                    None
                } else {
                    Some(finished)
                }
            }
            Event::Empty(e) => {
                let (namespace, local) = resolve_name(&e, self.stack.last());
                let mut el = Element::new(local, Some(namespace));
                for a in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
                    if key == "xmlns" || key.starts_with("xmlns:") {
                        continue;
                    }
                    let value = a.unescape_value().unwrap_or_default().to_string();
                    el.set_attr(key, value);
                }
                if let Some(parent) = self.stack.last_mut() {
                    parent.append_child(el);
                    None
                } else {
                    Some(el)
                }
            }
            Event::Text(t) => {
                if let Some(parent) = self.stack.last_mut() {
                    let text = t.unescape().unwrap_or_default().to_string();
                    if !text.is_empty() {
                        parent.append_text(text);
                    }
                }
                None
            }
            _ => None,
        }
    }
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| a.unescape_value().unwrap_or_default().to_string())
}

/// Resolves a tag's local name and effective namespace. XMPP documents
/// use a fixed, small prefix vocabulary (`stream:` for
/// `http://etherx.jabber.org/streams`); anything else either declares
/// its own `xmlns` or inherits the parent's.
fn resolve_name(e: &quick_xml::events::BytesStart<'_>, parent: Option<&Element>) -> (String, String) {
    let raw = String::from_utf8_lossy(e.name().as_ref()).to_string();
    if let Some(local) = raw.strip_prefix("stream:") {
        return (STREAM_NS.to_string(), local.to_string());
    }
    let declared = attr(e, "xmlns");
    let namespace = declared.unwrap_or_else(|| {
        parent
            .and_then(|p| p.namespace.clone())
            .unwrap_or_else(|| CLIENT_NS.to_string())
    });
    (namespace, raw)
}

/// Serializes one outbound [`Element`] back into wire bytes, translating
/// the synthetic `<open>`/`<close>` framing into a real
/// `<stream:stream>` open tag / close tag.
fn serialize(el: &Element) -> String {
    if el.namespace.as_deref() == Some("urn:ietf:params:xml:ns:xmpp-framing") {
        return match el.name.as_str() {
            "open" => format!(
                "<stream:stream to='{}' version='1.0' xmlns='{CLIENT_NS}' xmlns:stream='{STREAM_NS}'>",
                el.attr("to").unwrap_or_default()
            ),
            "close" => "</stream:stream>".to_string(),
            _ => String::new(),
        };
    }
    el.to_string()
}

async fn dial(domain: &str, candidates: &[ConnectionCandidate], tls_verify: bool) -> Result<(Wire, bool)> {
    for candidate in candidates {
        if let ConnectionCandidate::Tcp { domain: host, port, tls } = candidate {
            match TcpStream::connect((host.as_str(), *port)).await {
                Ok(stream) => {
                    info!("TCP connected to {host}:{port}");
                    return Ok((Wire::Plain(stream), *tls == TcpTls::StartTls));
                }
                Err(e) => warn!("connect to {host}:{port} failed: {e}"),
            }
        }
    }
    // Fall back to the domain itself on the default client port.
    let stream = TcpStream::connect((domain, 5222)).await?;
    let _ = tls_verify;
    Ok((Wire::Plain(stream), true))
}

async fn upgrade_tls(wire: Wire, domain: &str, tls_verify: bool) -> Result<Wire> {
    let Wire::Plain(stream) = wire else {
        return Ok(wire);
    };
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!tls_verify)
        .build()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls_stream = connector.connect(domain, stream).await?;
    Ok(Wire::Tls(tls_stream))
}

async fn run_session(login: &LoginConfig) -> Result<()> {
    let jid = login.parsed_jid()?;
    let domain = jid.domain_part().to_string();

    let candidates = discovery::discover(&domain).await;
    let (mut wire, starttls_available) = dial(&domain, &candidates, login.tls_verify).await?;

    let mut session = Session::new();
    session.login(LoginRequest {
        jid: jid.clone(),
        resource: login.resource.clone(),
        credentials: Box::new(Credentials {
            password: login.password.clone(),
        }),
    })?;

    let mut framer = Framer::default();
    let mut buf = [0u8; 4096];
    let mut tls_pending = false;

    loop {
        for event in session.take_events() {
            match event {
                SessionEvent::Outbound(el) => {
                    if el.name == "starttls" && !starttls_available {
                        return Err(anyhow!("server offered no STARTTLS and none requested"));
                    }
                    wire.write_all(serialize(&el).as_bytes()).await?;
                    if el.name == "starttls" {
                        tls_pending = true;
                    }
                }
                SessionEvent::TlsDeployRequested => {
                    tls_pending = false;
                    match upgrade_tls(wire, &domain, login.tls_verify).await {
                        Ok(upgraded) => {
                            wire = upgraded;
                            info!("TLS established");
                            session.tls_deployed(Ok(()));
                        }
                        Err(e) => {
                            session.tls_deployed(Err(e.to_string()));
                            return Err(e);
                        }
                    }
                }
                SessionEvent::StateChanged(state) => {
                    info!("session state -> {state:?}");
                    if state == SessionState::Online {
                        info!("online as {jid}");
                    }
                }
                SessionEvent::FeatureNegotiated(ns, name) => {
                    info!("feature negotiated: {{{ns}}}{name}");
                }
                SessionEvent::Failed(message) => {
                    warn!("handshake failed: {message}");
                }
                SessionEvent::Online(resolved) => {
                    info!("bound JID: {resolved}");
                }
                SessionEvent::Stanza(stanza) => {
                    info!("inbound stanza: {stanza}");
                }
            }
        }

        if session.state() == SessionState::Disconnected || session.state() == SessionState::Disposed {
            return Ok(());
        }

        let n = wire.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("connection closed by peer"));
        }
        for element in framer.feed(&buf[..n]) {
            session.feed(element);
        }
        let _ = tls_pending;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xmpp_demo=info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config/login.toml".to_string());
    let login = LoginConfig::load(&config_path)?;

    let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60), 2);

    loop {
        info!("connecting (attempt {})...", backoff.attempt + 1);
        let started = Instant::now();

        if let Err(e) = run_session(&login).await {
            error!("session error: {e}");
        }

        if started.elapsed() >= STABILITY_THRESHOLD {
            backoff.reset();
        }
        if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
            return Err(anyhow!("exceeded {MAX_RECONNECT_ATTEMPTS} reconnection attempts"));
        }

        let delay = backoff.next_delay();
        info!("reconnecting in {}s", delay.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
