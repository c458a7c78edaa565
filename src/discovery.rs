//! Connection discovery (spec §4.5): resolves a bare domain into a
//! prioritized list of connection candidates via DNS SRV/TXT and
//! host-meta. Grounded on `waddle-xmpp/src/s2s/dns.rs` (hickory-resolver
//! SRV lookup) and `mongodb-mongo-rust-driver/src/srv.rs` (the
//! multi-source composition-with-partial-failure pattern).

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, instrument, warn};
use url::Url;

/// How a TCP candidate expects to reach TLS. Normative per spec §9: a
/// single variant type rather than the source's ambiguous mix of a
/// nullable method and an explicit enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTls {
    None,
    StartTls,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsScheme {
    Ws,
    Wss,
}

impl WsScheme {
    fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }
}

/// One resolved connection candidate (spec §3 "Connection candidate").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCandidate {
    Tcp {
        domain: String,
        port: u16,
        tls: TcpTls,
    },
    WebSocket {
        scheme: WsScheme,
        domain: String,
        port: u16,
        path: String,
    },
}

const DEFAULT_XMPP_CLIENT_PORT: u16 = 5222;
const DEFAULT_XMPPS_CLIENT_PORT: u16 = 5223;

type TokioResolver = TokioAsyncResolver;

fn build_resolver() -> TokioResolver {
    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
}

/// Runs the full discovery pipeline for `domain`. Each of the four
/// sources (TXT, direct-TLS SRV, StartTLS SRV, host-meta) is queried
/// independently; a failure in one does not suppress the others. The
/// returned list preserves the documented priority order: TXT,
/// direct-TLS SRV, StartTLS SRV, then host-meta. An empty list is a
/// valid, non-error outcome.
#[instrument(skip_all, fields(domain = %domain))]
pub async fn discover(domain: &str) -> Vec<ConnectionCandidate> {
    let resolver = build_resolver();

    let (txt, direct_tls, starttls, host_meta) = tokio::join!(
        discover_websocket_txt(&resolver, domain),
        discover_srv(&resolver, domain, "_xmpps-client._tcp", TcpTls::Direct),
        discover_srv(&resolver, domain, "_xmpp-client._tcp", TcpTls::StartTls),
        discover_host_meta(domain),
    );

    let mut candidates = Vec::new();
    candidates.extend(txt);
    candidates.extend(direct_tls);
    candidates.extend(starttls);
    candidates.extend(host_meta);
    candidates
}

#[instrument(skip(resolver))]
async fn discover_srv(
    resolver: &TokioResolver,
    domain: &str,
    service: &str,
    tls: TcpTls,
) -> Vec<ConnectionCandidate> {
    let name = format!("{service}.{domain}");
    match resolver.srv_lookup(name.as_str()).await {
        Ok(lookup) => lookup
            .iter()
            .map(|srv| ConnectionCandidate::Tcp {
                domain: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
                tls,
            })
            .collect(),
        Err(e) => {
            debug!("SRV lookup {name} produced no usable records: {e}");
            Vec::new()
        }
    }
}

#[instrument(skip(resolver))]
async fn discover_websocket_txt(resolver: &TokioResolver, domain: &str) -> Vec<ConnectionCandidate> {
    let name = format!("_xmppconnect.{domain}");
    let lookup = match resolver.txt_lookup(name.as_str()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!("TXT lookup {name} produced no usable records: {e}");
            return Vec::new();
        }
    };

    lookup
        .iter()
        .map(|txt| txt.to_string())
        .filter_map(|value| value.strip_prefix("_xmpp-client-websocket=").map(str::to_string))
        .filter_map(|uri| parse_websocket_candidate(&uri))
        .collect()
}

#[instrument]
async fn discover_host_meta(domain: &str) -> Vec<ConnectionCandidate> {
    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            warn!("could not build host-meta HTTP client: {e}");
            return Vec::new();
        }
    };

    let xml = fetch_host_meta_xml(&client, domain).await;
    if !xml.is_empty() {
        return xml;
    }
    fetch_host_meta_json(&client, domain).await
}

async fn fetch_host_meta_xml(client: &reqwest::Client, domain: &str) -> Vec<ConnectionCandidate> {
    let url = format!("https://{domain}/.well-known/host-meta");
    let body = match client.get(&url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!("host-meta body fetch failed for {url}: {e}");
                return Vec::new();
            }
        },
        Err(e) => {
            debug!("host-meta fetch failed for {url}: {e}");
            return Vec::new();
        }
    };

    parse_host_meta_xml(&body).unwrap_or_else(|e| {
        warn!("malformed host-meta XML from {domain}, treating as empty: {e}");
        Vec::new()
    })
}

async fn fetch_host_meta_json(client: &reqwest::Client, domain: &str) -> Vec<ConnectionCandidate> {
    let url = format!("https://{domain}/.well-known/host-meta.json");
    let body = match client.get(&url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!("host-meta.json body fetch failed for {url}: {e}");
                return Vec::new();
            }
        },
        Err(e) => {
            debug!("host-meta.json fetch failed for {url}: {e}");
            return Vec::new();
        }
    };

    parse_host_meta_json(&body).unwrap_or_else(|e| {
        warn!("malformed host-meta.json from {domain}, treating as empty: {e}");
        Vec::new()
    })
}

const ALT_CONNECTIONS_WEBSOCKET_REL: &str = "urn:xmpp:alt-connections:websocket";

/// Extracts `<Link rel="urn:xmpp:alt-connections:websocket" href="…"/>`
/// entries from an RFC 6415 XRD document. This is intentionally a
/// narrow, attribute-grep-style reader rather than a general XML parser
/// — XML parsing proper is out of scope (spec §1); host-meta documents
/// are a fixed, tiny shape.
fn parse_host_meta_xml(body: &str) -> Result<Vec<ConnectionCandidate>, String> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut candidates = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Empty(e)) | Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() != b"Link" {
                    continue;
                }
                let mut rel = None;
                let mut href = None;
                for attr in e.attributes().flatten() {
                    let key = attr.key.local_name();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| format!("bad attribute value: {e}"))?
                        .to_string();
                    match key.as_ref() {
                        b"rel" => rel = Some(value),
                        b"href" => href = Some(value),
                        _ => {}
                    }
                }
                if rel.as_deref() == Some(ALT_CONNECTIONS_WEBSOCKET_REL) {
                    if let Some(href) = href {
                        if let Some(candidate) = parse_websocket_candidate(&href) {
                            candidates.push(candidate);
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("XML parse error: {e}")),
        }
        buf.clear();
    }

    Ok(candidates)
}

/// Extracts the same `links` array shape from `host-meta.json`.
fn parse_host_meta_json(body: &str) -> Result<Vec<ConnectionCandidate>, String> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let links = value
        .get("links")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(links
        .iter()
        .filter(|link| link.get("rel").and_then(|r| r.as_str()) == Some(ALT_CONNECTIONS_WEBSOCKET_REL))
        .filter_map(|link| link.get("href").and_then(|h| h.as_str()))
        .filter_map(parse_websocket_candidate)
        .collect())
}

fn parse_websocket_candidate(uri: &str) -> Option<ConnectionCandidate> {
    let url = Url::parse(uri).ok()?;
    let scheme = WsScheme::from_url_scheme(url.scheme())?;
    let domain = url.host_str()?.to_string();
    let port = url.port().unwrap_or(match scheme {
        WsScheme::Ws => 80,
        WsScheme::Wss => 443,
    });
    let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };

    Some(ConnectionCandidate::WebSocket {
        scheme,
        domain,
        port,
        path,
    })
}

#[allow(dead_code)]
fn default_tcp_port(tls: TcpTls) -> u16 {
    match tls {
        TcpTls::Direct => DEFAULT_XMPPS_CLIENT_PORT,
        TcpTls::StartTls | TcpTls::None => DEFAULT_XMPP_CLIENT_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_candidate_defaults_port_from_scheme() {
        let candidate = parse_websocket_candidate("wss://ws.example.com/xmpp").unwrap();
        assert_eq!(
            candidate,
            ConnectionCandidate::WebSocket {
                scheme: WsScheme::Wss,
                domain: "ws.example.com".to_string(),
                port: 443,
                path: "/xmpp".to_string(),
            }
        );
    }

    #[test]
    fn websocket_candidate_keeps_explicit_port() {
        let candidate = parse_websocket_candidate("wss://ws.example.com:443/xmpp").unwrap();
        assert_eq!(
            candidate,
            ConnectionCandidate::WebSocket {
                scheme: WsScheme::Wss,
                domain: "ws.example.com".to_string(),
                port: 443,
                path: "/xmpp".to_string(),
            }
        );
    }

    #[test]
    fn non_ws_scheme_is_rejected() {
        assert!(parse_websocket_candidate("https://example.com/xmpp").is_none());
    }

    #[test]
    fn host_meta_xml_extracts_websocket_link() {
        let xml = r#"<?xml version="1.0"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="urn:xmpp:alt-connections:websocket" href="wss://alt.example.com/ws"/>
  <Link rel="urn:xmpp:alt-connections:xbosh" href="https://example.com/bosh"/>
</XRD>"#;
        let candidates = parse_host_meta_xml(xml).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0],
            ConnectionCandidate::WebSocket {
                scheme: WsScheme::Wss,
                domain: "alt.example.com".to_string(),
                port: 443,
                path: "/ws".to_string(),
            }
        );
    }

    #[test]
    fn host_meta_xml_malformed_is_reported_not_panicked() {
        assert!(parse_host_meta_xml("<not-valid").is_err());
    }

    #[test]
    fn host_meta_json_extracts_websocket_link() {
        let json = r#"{
            "links": [
                {"rel": "urn:xmpp:alt-connections:websocket", "href": "wss://alt.example.com/ws"},
                {"rel": "urn:xmpp:alt-connections:xbosh", "href": "https://example.com/bosh"}
            ]
        }"#;
        let candidates = parse_host_meta_json(json).unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
