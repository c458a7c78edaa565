//! XMPP address (`local@domain/resource`).

use std::fmt;

use thiserror::Error;

/// Failure parsing a JID string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JidError {
    #[error("JID has an empty domain")]
    EmptyDomain,
}

/// A parsed XMPP address, `local@domain/resource` with `local` and
/// `resource` optional.
///
/// `local` and `domain` are lowercased at parse time so that equality is
/// case-insensitive on those two parts; `resource` is kept verbatim.
#[derive(Debug, Clone, Default, Eq)]
pub struct Jid {
    local: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// The empty JID: the sentinel for "anonymous" or "unaddressed".
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a JID from already-normalized parts, without lowercasing.
    /// Used internally once a string has already been through `parse`.
    fn from_parts(local: String, domain: String, resource: String) -> Self {
        Self {
            local,
            domain,
            resource,
        }
    }

    /// Parses `local@domain/resource`. `@local` and `/resource` are both
    /// optional. The first `@` and the first `/` *after* it delimit the
    /// segments, so a resource may itself contain `@` or `/`.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let (local, rest) = match s.split_once('@') {
            Some((local, rest)) => (local, rest),
            None => ("", s),
        };
        let (domain, resource) = match rest.split_once('/') {
            Some((domain, resource)) => (domain, resource),
            None => (rest, ""),
        };

        if domain.is_empty() && (!local.is_empty() || !resource.is_empty()) {
            return Err(JidError::EmptyDomain);
        }

        Ok(Self::from_parts(
            local.to_lowercase(),
            domain.to_lowercase(),
            resource.to_string(),
        ))
    }

    pub fn local_part(&self) -> &str {
        &self.local
    }

    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    pub fn resource_part(&self) -> &str {
        &self.resource
    }

    /// The sentinel empty JID: all three parts empty.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty() && self.resource.is_empty()
    }

    /// The bare JID (`local@domain`), dropping any resource.
    pub fn to_bare(&self) -> Self {
        Self::from_parts(self.local.clone(), self.domain.clone(), String::new())
    }

    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        Self::from_parts(self.local.clone(), self.domain.clone(), resource.into())
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.local.is_empty() {
            write!(f, "{}@", self.local)?;
        }
        write!(f, "{}", self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.domain == other.domain && self.resource == other.resource
    }
}

impl std::str::FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}
