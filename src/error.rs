//! Crate-wide error taxonomy (spec §7).
//!
//! One enum per module boundary, unified under [`Error`] — mirrors
//! `mongodb-mongo-rust-driver/src/error.rs`'s "one big enum with `#[from]`
//! leaves" shape rather than the teacher's flat `anyhow::Error`, since this
//! crate's callers need to match on a closed set of conditions (SASL
//! failure handling, stream-error propagation, reconnect policy).

use std::fmt;

use thiserror::Error;

use crate::jid::JidError;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of RFC 6120 stream-error conditions this crate can
/// raise or observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    UnsupportedVersion,
    InvalidFrom,
    NotAuthorized,
    PolicyViolation,
    UnsupportedStanzaType,
    InvalidXml,
    Conflict,
    HostUnknown,
    Undefined,
}

impl StreamErrorCondition {
    pub fn local_name(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion => "unsupported-version",
            Self::InvalidFrom => "invalid-from",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::InvalidXml => "invalid-xml",
            Self::Conflict => "conflict",
            Self::HostUnknown => "host-unknown",
            Self::Undefined => "undefined-condition",
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_name())
    }
}

/// Stanza (IQ) error type attribute, RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Cancel,
    Continue,
    Modify,
    Auth,
    Wait,
}

/// A handful of the RFC 6120 stanza-error conditions this crate raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    ServiceUnavailable,
    ItemNotFound,
    BadRequest,
    FeatureNotImplemented,
}

impl StanzaErrorCondition {
    pub fn local_name(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "service-unavailable",
            Self::ItemNotFound => "item-not-found",
            Self::BadRequest => "bad-request",
            Self::FeatureNotImplemented => "feature-not-implemented",
        }
    }
}

/// The closed set of SASL/SCRAM authentication failure conditions
/// (spec §7).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("authentication aborted")]
    Aborted,
    #[error("client not authorized: {0}")]
    ClientNotAuthorized(String),
    #[error("server signature did not verify")]
    ServerNotAuthorized,
    #[error("no credentials available for this mechanism")]
    CredentialsNotFound,
    #[error("credentials expired")]
    CredentialsExpired,
    #[error("malformed SASL/SCRAM message: {0}")]
    MalformedRequest(String),
    #[error("invalid mechanism")]
    InvalidMechanism,
    #[error("mechanism too weak")]
    MechanismTooWeak,
    #[error("encryption required")]
    EncryptionRequired,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("account disabled")]
    AccountDisabled,
    #[error("invalid authzid")]
    InvalidAuthzid,
    #[error("incorrect encoding")]
    IncorrectEncoding,
}

/// Transport-level failures; fatal for the current session state,
/// recoverable by reconnect.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection refused")]
    Refused,
    #[error("connection lost")]
    Lost,
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("handshake was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid JID: {0}")]
    Jid(#[from] JidError),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("malformed host-meta document: {0}")]
    InvalidHostMeta(String),

    #[error("stream error <{condition}>{}", text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    Stream {
        condition: StreamErrorCondition,
        text: Option<String>,
    },

    #[error("stanza error <{}>", condition.local_name())]
    Stanza {
        kind: StanzaErrorType,
        condition: StanzaErrorCondition,
        text: Option<String>,
    },

    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl Error {
    pub fn stream(condition: StreamErrorCondition) -> Self {
        Self::Stream {
            condition,
            text: None,
        }
    }

    pub fn stream_with_text(condition: StreamErrorCondition, text: impl Into<String>) -> Self {
        Self::Stream {
            condition,
            text: Some(text.into()),
        }
    }

    pub fn stanza(kind: StanzaErrorType, condition: StanzaErrorCondition) -> Self {
        Self::Stanza {
            kind,
            condition,
            text: None,
        }
    }

    /// Whether retrying the operation that produced this error might
    /// succeed later (used by the reconnect loop).
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Dns(_))
    }
}
