//! SCRAM client state machine (spec §4.3).
//!
//! ```text
//! INIT --respond()--> SENT_FIRST --accept_challenge()--> GOT_CHALLENGE
//!   --respond()--> SENT_FINAL --accept_final()--> DONE
//! ```
//! Any call out of this order fails with [`ScramClientError::InvalidState`].
//! `respond`/`accept_challenge`/`accept_final` never suspend — they are
//! pure transitions over already-materialized byte buffers (spec §5).

use rand::RngCore;
use thiserror::Error;

use super::mechanism::{
    auth_message, base64_decode, base64_encode, client_final_without_proof, client_first_bare,
    gs2_header, xor, MechanismError, ScramAlgorithm, ScramMessage,
};
use crate::error::AuthenticationError;

/// Where a [`ScramClient`] caches previously-derived credentials,
/// looked up by key: `"salted-password"`, `"salt"`, `"iteration"`, and,
/// as a fallback, `"password"`. The retriever is consulted at most
/// twice per handshake (spec §5).
pub trait CredentialRetriever: Send {
    fn get(&self, key: &str) -> Option<String>;
}

/// A retriever backed by a plain in-memory cleartext password — the
/// common case when no prior SCRAM session has cached derived keys.
pub struct PasswordRetriever(pub String);

impl CredentialRetriever for PasswordRetriever {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "password" => Some(self.0.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramClientState {
    Init,
    SentFirst,
    GotChallenge,
    SentFinal,
    Done,
}

#[derive(Debug, Error)]
pub enum ScramClientError {
    #[error("SCRAM client method called out of order")]
    InvalidState,
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Mechanism(#[from] MechanismError),
}

/// Generates the initial nonce: 6 cryptographically random bytes,
/// base64-encoded (spec §4.3 edge-case policy).
fn generate_nonce() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64_encode(&bytes)
}

pub struct ScramClient {
    algorithm: ScramAlgorithm,
    username: String,
    authzid: Option<String>,
    state: ScramClientState,
    initial_nonce: String,
    full_nonce: String,
    client_first_bare: String,
    server_first: String,
    salted_password: Vec<u8>,
    expected_server_signature: Vec<u8>,
}

impl ScramClient {
    pub fn new(algorithm: ScramAlgorithm, username: impl Into<String>) -> Self {
        Self::with_authzid(algorithm, username, None)
    }

    pub fn with_authzid(
        algorithm: ScramAlgorithm,
        username: impl Into<String>,
        authzid: Option<String>,
    ) -> Self {
        Self {
            algorithm,
            username: username.into(),
            authzid,
            state: ScramClientState::Init,
            initial_nonce: generate_nonce(),
            full_nonce: String::new(),
            client_first_bare: String::new(),
            server_first: String::new(),
            salted_password: Vec::new(),
            expected_server_signature: Vec::new(),
        }
    }

    /// Test/harness hook: fixes the initial nonce instead of drawing it
    /// from the RNG, so exchanges can be reproduced deterministically.
    pub fn with_fixed_nonce(
        algorithm: ScramAlgorithm,
        username: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        let mut client = Self::new(algorithm, username);
        client.initial_nonce = nonce.into();
        client
    }

    pub fn state(&self) -> ScramClientState {
        self.state
    }

    pub fn mechanism_name(&self) -> String {
        self.algorithm.mechanism_name()
    }

    /// Emits the client's next outbound message. Called twice over the
    /// lifetime of a successful exchange: once from `Init` (producing
    /// the client-first message) and once from `GotChallenge`
    /// (producing the client-final message).
    pub fn respond(
        &mut self,
        credentials: &dyn CredentialRetriever,
    ) -> Result<String, ScramClientError> {
        match self.state {
            ScramClientState::Init => {
                self.client_first_bare = client_first_bare(&self.username, &self.initial_nonce);
                let message = format!(
                    "{}{}",
                    gs2_header(self.authzid.as_deref()),
                    self.client_first_bare
                );
                self.state = ScramClientState::SentFirst;
                Ok(message)
            }
            ScramClientState::GotChallenge => {
                let _ = credentials; // already consumed in accept_challenge
                let client_key = self.algorithm.client_key(&self.salted_password);
                let stored_key = self.algorithm.stored_key(&client_key);
                let server_key = self.algorithm.server_key(&self.salted_password);

                let without_proof =
                    client_final_without_proof(&gs2_header(self.authzid.as_deref()), &self.full_nonce);
                let message = auth_message(&self.client_first_bare, &self.server_first, &without_proof);
                let client_signature = self.algorithm.client_signature(&stored_key, &message);
                let client_proof = xor(&client_key, &client_signature);
                self.expected_server_signature = self.algorithm.server_signature(&server_key, &message);

                self.state = ScramClientState::SentFinal;
                Ok(format!("{without_proof},p={}", base64_encode(&client_proof)))
            }
            _ => Err(ScramClientError::InvalidState),
        }
    }

    /// Consumes the server-first (challenge) message.
    pub fn accept_challenge(
        &mut self,
        credentials: &dyn CredentialRetriever,
        challenge: &str,
    ) -> Result<(), ScramClientError> {
        if self.state != ScramClientState::SentFirst {
            return Err(ScramClientError::InvalidState);
        }

        let parsed = ScramMessage::parse(challenge)?;

        if parsed.has('m') {
            return Err(AuthenticationError::MalformedRequest("extensions (m=) are not supported".into()).into());
        }

        let server_nonce = parsed
            .get('r')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing nonce".into()))?;
        if !server_nonce.starts_with(&self.initial_nonce) {
            return Err(AuthenticationError::ServerNotAuthorized.into());
        }
        // The server must actually extend the nonce with its own entropy.
        if server_nonce.len() == self.initial_nonce.len() {
            return Err(AuthenticationError::ServerNotAuthorized.into());
        }

        let salt_b64 = parsed
            .get('s')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing salt".into()))?;
        let salt = base64_decode(salt_b64)?;
        if salt.is_empty() {
            return Err(AuthenticationError::MalformedRequest("empty salt".into()).into());
        }

        let iteration: u32 = parsed
            .get('i')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing iteration count".into()))?
            .parse()
            .map_err(|_| AuthenticationError::MalformedRequest("non-numeric iteration count".into()))?;
        if iteration < 1 {
            return Err(AuthenticationError::MalformedRequest("iteration count must be >= 1".into()).into());
        }

        self.salted_password = self.resolve_salted_password(credentials, &salt, iteration, salt_b64)?;
        self.full_nonce = server_nonce.to_string();
        self.server_first = challenge.to_string();
        self.state = ScramClientState::GotChallenge;
        Ok(())
    }

    /// Resolves `SaltedPassword`, reusing the retriever's cached value
    /// when its `(salt, iteration)` match the server challenge — in
    /// which case `"password"` is never looked up (spec §8 invariant).
    fn resolve_salted_password(
        &self,
        credentials: &dyn CredentialRetriever,
        salt: &[u8],
        iteration: u32,
        salt_b64: &str,
    ) -> Result<Vec<u8>, ScramClientError> {
        let cached = (
            credentials.get("salted-password"),
            credentials.get("salt"),
            credentials.get("iteration"),
        );
        if let (Some(sp_b64), Some(cached_salt), Some(cached_iter)) = cached {
            if cached_salt == salt_b64 && cached_iter == iteration.to_string() {
                return Ok(base64_decode(&sp_b64)?);
            }
        }

        let password = credentials
            .get("password")
            .ok_or(AuthenticationError::CredentialsNotFound)?;
        Ok(self.algorithm.salted_password(password.as_bytes(), salt, iteration)?)
    }

    /// Consumes the server-final (result) message: either `e=<error>`
    /// or `v=<server signature>`.
    pub fn accept_final(&mut self, result: &str) -> Result<(), ScramClientError> {
        if self.state != ScramClientState::SentFinal {
            return Err(ScramClientError::InvalidState);
        }

        let parsed = ScramMessage::parse(result)?;

        if let Some(error) = parsed.get('e') {
            self.state = ScramClientState::Done;
            return Err(AuthenticationError::ClientNotAuthorized(error.to_string()).into());
        }

        let signature_b64 = parsed
            .get('v')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing server signature".into()))?;
        let signature = base64_decode(signature_b64)?;

        if signature != self.expected_server_signature {
            self.state = ScramClientState::Done;
            return Err(AuthenticationError::ServerNotAuthorized.into());
        }

        self.state = ScramClientState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_rfc5802_exchange() -> ScramClient {
        let mut client = ScramClient::with_fixed_nonce(
            ScramAlgorithm::Sha1,
            "user",
            "fyko+d2lbbFgONRv9qkxdawL",
        );
        let creds = PasswordRetriever("pencil".to_string());

        let first = client.respond(&creds).unwrap();
        assert_eq!(first, "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");

        let server_first = "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        client.accept_challenge(&creds, server_first).unwrap();

        let final_msg = client.respond(&creds).unwrap();
        assert_eq!(
            final_msg,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        let server_final = "v=rmF9pqV8S7suAoZWja4dJRkFsKQ=";
        client.accept_final(server_final).unwrap();
        client
    }

    #[test]
    fn rfc5802_round_trip_completes() {
        let client = run_rfc5802_exchange();
        assert_eq!(client.state(), ScramClientState::Done);
    }

    #[test]
    fn out_of_order_call_is_invalid_state() {
        let mut client = ScramClient::new(ScramAlgorithm::Sha1, "user");
        let creds = PasswordRetriever("pencil".to_string());
        assert!(matches!(
            client.accept_final("v=abc"),
            Err(ScramClientError::InvalidState)
        ));
        client.respond(&creds).unwrap();
        assert!(matches!(
            client.respond(&creds),
            Err(ScramClientError::InvalidState)
        ));
    }

    #[test]
    fn server_nonce_must_extend_client_nonce() {
        let mut client = ScramClient::with_fixed_nonce(ScramAlgorithm::Sha1, "user", "abc");
        let creds = PasswordRetriever("pencil".to_string());
        client.respond(&creds).unwrap();
        let result = client.accept_challenge(&creds, "r=xyz,s=ZGVm,i=4096");
        assert!(matches!(
            result,
            Err(ScramClientError::Authentication(AuthenticationError::ServerNotAuthorized))
        ));
    }

    #[test]
    fn extension_attribute_is_rejected() {
        let mut client = ScramClient::with_fixed_nonce(ScramAlgorithm::Sha1, "user", "abc");
        let creds = PasswordRetriever("pencil".to_string());
        client.respond(&creds).unwrap();
        let result = client.accept_challenge(&creds, "r=abcxyz,s=ZGVm,i=4096,m=ext");
        assert!(matches!(
            result,
            Err(ScramClientError::Authentication(AuthenticationError::MalformedRequest(_)))
        ));
    }

    #[test]
    fn cached_salted_password_skips_password_lookup() {
        struct CountingRetriever {
            salted_password_b64: String,
            salt_b64: String,
            iteration: String,
        }
        impl CredentialRetriever for CountingRetriever {
            fn get(&self, key: &str) -> Option<String> {
                match key {
                    "salted-password" => Some(self.salted_password_b64.clone()),
                    "salt" => Some(self.salt_b64.clone()),
                    "iteration" => Some(self.iteration.clone()),
                    "password" => panic!("password must not be looked up when cache matches"),
                    _ => None,
                }
            }
        }

        let salt = base64_decode("QSXCR+Q6sek8bf92").unwrap();
        let salted_password = ScramAlgorithm::Sha1.salted_password(b"pencil", &salt, 4096).unwrap();
        let creds = CountingRetriever {
            salted_password_b64: base64_encode(&salted_password),
            salt_b64: "QSXCR+Q6sek8bf92".to_string(),
            iteration: "4096".to_string(),
        };

        let mut client = ScramClient::with_fixed_nonce(
            ScramAlgorithm::Sha1,
            "user",
            "fyko+d2lbbFgONRv9qkxdawL",
        );
        client.respond(&creds).unwrap();
        client
            .accept_challenge(
                &creds,
                "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        let final_msg = client.respond(&creds).unwrap();
        assert!(final_msg.starts_with("c=biws,r="));
    }

    #[test]
    fn server_error_surfaces_as_client_not_authorized() {
        let mut client = run_rfc5802_exchange_until_sent_final();
        let result = client.accept_final("e=invalid-proof");
        assert!(matches!(
            result,
            Err(ScramClientError::Authentication(AuthenticationError::ClientNotAuthorized(_)))
        ));
    }

    fn run_rfc5802_exchange_until_sent_final() -> ScramClient {
        let mut client = ScramClient::with_fixed_nonce(
            ScramAlgorithm::Sha1,
            "user",
            "fyko+d2lbbFgONRv9qkxdawL",
        );
        let creds = PasswordRetriever("pencil".to_string());
        client.respond(&creds).unwrap();
        client
            .accept_challenge(
                &creds,
                "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        client.respond(&creds).unwrap();
        client
    }

    #[test]
    fn mismatched_server_signature_is_rejected() {
        let mut client = run_rfc5802_exchange_until_sent_final();
        let result = client.accept_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert!(matches!(
            result,
            Err(ScramClientError::Authentication(AuthenticationError::ServerNotAuthorized))
        ));
    }
}
