//! Login configuration (spec §11.3, ambient). The login-relevant subset
//! of the teacher's `config.rs::ConnectionMode::Client` — JID, password,
//! resource, and a registration flag — deserialized with `serde` the
//! same way, including the `${ENV_VAR}` substitution the teacher applies
//! to secrets before parsing.

use serde::Deserialize;

use crate::jid::Jid;

#[derive(Debug, Deserialize, Clone)]
pub struct LoginConfig {
    /// Bot JID, e.g. `"bot@example.com"`.
    pub jid: String,
    /// Supports `${ENV_VAR}` substitution.
    pub password: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Set to false for self-signed certs (dev servers).
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    /// Request in-band registration (XEP-0077) instead of assuming the
    /// account already exists.
    #[serde(default)]
    pub register: bool,
}

fn default_resource() -> String {
    "xmpp-core".to_string()
}

fn default_tls_verify() -> bool {
    true
}

impl LoginConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        let config: LoginConfig = toml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn parsed_jid(&self) -> Result<Jid, crate::error::Error> {
        Ok(Jid::parse(&self.jid)?)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub password: String,
}

impl crate::scram::CredentialRetriever for Credentials {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "password" => Some(self.password.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_toml() {
        let toml = r#"
            jid = "bot@example.com"
            password = "secret"
        "#;
        let config: LoginConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.resource, "xmpp-core");
        assert!(config.tls_verify);
        assert!(!config.register);
    }

    #[test]
    fn parsed_jid_rejects_malformed_address() {
        let config = LoginConfig {
            jid: "@".to_string(),
            password: String::new(),
            resource: String::new(),
            tls_verify: true,
            register: false,
        };
        assert!(config.parsed_jid().is_err());
    }
}
