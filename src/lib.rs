//! Core XMPP client protocol engine: stream handshake, SASL SCRAM,
//! connection discovery, and a pluggable stanza pipeline.
//!
//! The crate never touches raw bytes or sockets — see [`discovery`] for
//! the one place that does real I/O (DNS and host-meta HTTP), and the
//! `xmpp_demo` binary for a worked transport wiring the rest of this
//! crate to a live TCP/StartTLS connection.

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod jid;
pub mod pipeline;
pub mod plugin;
pub mod scram;
pub mod session;
pub mod xml;

pub use error::{Error, Result};
pub use jid::Jid;
pub use session::{LoginRequest, Session, SessionEvent, SessionState};
