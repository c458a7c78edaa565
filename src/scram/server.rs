//! SCRAM server-side mirror of [`super::client::ScramClient`] (spec §4.4).
//!
//! This exists purely to let the client state machine be exercised
//! end-to-end in tests without a live server; it is not part of the
//! client-facing public surface used by [`crate::handshake`].

use rand::RngCore;
use thiserror::Error;

use super::mechanism::{
    auth_message, base64_decode, base64_encode, client_final_without_proof, gs2_header, xor,
    MechanismError, ScramAlgorithm, ScramMessage,
};
use crate::error::AuthenticationError;

pub const DEFAULT_SALT_LEN: usize = 8;
pub const DEFAULT_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramServerState {
    Init,
    SentFirst,
    Done,
}

#[derive(Debug, Error)]
pub enum ScramServerError {
    #[error("SCRAM server method called out of order")]
    InvalidState,
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Mechanism(#[from] MechanismError),
}

/// Server-side store of a single user's credentials, mirroring
/// [`super::client::CredentialRetriever`]'s key space.
pub struct ServerCredentials {
    pub salted_password: Vec<u8>,
    pub salt: Vec<u8>,
    pub iteration: u32,
}

impl ServerCredentials {
    /// Derives credentials fresh from a cleartext password, generating a
    /// random salt and using the default iteration count — the path a
    /// server takes the first time a user registers (spec §4.4).
    pub fn from_password(algorithm: ScramAlgorithm, password: &str) -> Result<Self, ScramServerError> {
        let mut salt = vec![0u8; DEFAULT_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let salted_password = algorithm.salted_password(password.as_bytes(), &salt, DEFAULT_ITERATIONS)?;
        Ok(Self {
            salted_password,
            salt,
            iteration: DEFAULT_ITERATIONS,
        })
    }
}

pub struct ScramServer {
    algorithm: ScramAlgorithm,
    state: ScramServerState,
    client_nonce: String,
    full_nonce: String,
    client_first_bare: String,
    server_first: String,
}

impl ScramServer {
    pub fn new(algorithm: ScramAlgorithm) -> Self {
        Self {
            algorithm,
            state: ScramServerState::Init,
            client_nonce: String::new(),
            full_nonce: String::new(),
            client_first_bare: String::new(),
            server_first: String::new(),
        }
    }

    pub fn state(&self) -> ScramServerState {
        self.state
    }

    /// Consumes the client-first message and produces the server-first
    /// challenge.
    pub fn accept_client_first(
        &mut self,
        client_first: &str,
        credentials: &ServerCredentials,
    ) -> Result<String, ScramServerError> {
        if self.state != ScramServerState::Init {
            return Err(ScramServerError::InvalidState);
        }

        let bare = strip_gs2_header(client_first)
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing gs2-header".into()))?;
        let parsed = ScramMessage::parse(bare)?;
        let nonce = parsed
            .get('r')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing nonce".into()))?;

        self.client_nonce = nonce.to_string();
        self.client_first_bare = bare.to_string();

        let mut server_entropy = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut server_entropy);
        self.full_nonce = format!("{}{}", self.client_nonce, base64_encode(&server_entropy));

        self.server_first = format!(
            "r={},s={},i={}",
            self.full_nonce,
            base64_encode(&credentials.salt),
            credentials.iteration
        );
        self.state = ScramServerState::SentFirst;
        Ok(self.server_first.clone())
    }

    /// Consumes the client-final message and produces the server-final
    /// result (`v=...` on success, `e=...` on failure).
    pub fn accept_client_final(
        &mut self,
        client_final: &str,
        credentials: &ServerCredentials,
    ) -> Result<String, ScramServerError> {
        if self.state != ScramServerState::SentFirst {
            return Err(ScramServerError::InvalidState);
        }

        let parsed = ScramMessage::parse(client_final)?;
        let nonce = parsed
            .get('r')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing nonce".into()))?;
        if nonce != self.full_nonce {
            self.state = ScramServerState::Done;
            return Ok("e=other-error".to_string());
        }

        let proof_b64 = parsed
            .get('p')
            .ok_or_else(|| AuthenticationError::MalformedRequest("missing proof".into()))?;
        let client_proof = base64_decode(proof_b64)?;

        let without_proof = client_final_without_proof(&gs2_header(None), &self.full_nonce);
        let message = auth_message(&self.client_first_bare, &self.server_first, &without_proof);

        let client_key = self.algorithm.client_key(&credentials.salted_password);
        let stored_key = self.algorithm.stored_key(&client_key);
        let client_signature = self.algorithm.client_signature(&stored_key, &message);
        let expected_client_key = xor(&client_proof, &client_signature);

        self.state = ScramServerState::Done;
        if self.algorithm.stored_key(&expected_client_key) != stored_key {
            return Ok("e=invalid-proof".to_string());
        }

        let server_key = self.algorithm.server_key(&credentials.salted_password);
        let server_signature = self.algorithm.server_signature(&server_key, &message);
        Ok(format!("v={}", base64_encode(&server_signature)))
    }
}

/// Strips the `gs2-header` (`cbind-flag,authzid-or-empty,`) prefix off a
/// client-first message, returning the bare message.
fn strip_gs2_header(client_first: &str) -> Option<&str> {
    let mut parts = client_first.splitn(3, ',');
    let _cbind_flag = parts.next()?;
    let _authzid = parts.next()?;
    parts.next()
}

#[cfg(test)]
mod tests {
    use super::super::client::{PasswordRetriever, ScramClient};
    use super::*;

    #[test]
    fn full_client_server_exchange_agrees_on_signatures() {
        let algo = ScramAlgorithm::Sha1;
        let creds = ServerCredentials::from_password(algo, "pencil").unwrap();

        let mut client = ScramClient::new(algo, "user");
        let client_creds = PasswordRetriever("pencil".to_string());
        let mut server = ScramServer::new(algo);

        let client_first = client.respond(&client_creds).unwrap();
        let server_first = server.accept_client_first(&client_first, &creds).unwrap();

        client.accept_challenge(&client_creds, &server_first).unwrap();
        let client_final = client.respond(&client_creds).unwrap();

        let server_final = server.accept_client_final(&client_final, &creds).unwrap();
        assert!(server_final.starts_with("v="));

        client.accept_final(&server_final).unwrap();
    }

    #[test]
    fn wrong_password_yields_error_result() {
        let algo = ScramAlgorithm::Sha1;
        let creds = ServerCredentials::from_password(algo, "pencil").unwrap();

        let mut client = ScramClient::new(algo, "user");
        let client_creds = PasswordRetriever("wrong-password".to_string());
        let mut server = ScramServer::new(algo);

        let client_first = client.respond(&client_creds).unwrap();
        let server_first = server.accept_client_first(&client_first, &creds).unwrap();
        client.accept_challenge(&client_creds, &server_first).unwrap();
        let client_final = client.respond(&client_creds).unwrap();

        let server_final = server.accept_client_final(&client_final, &creds).unwrap();
        assert!(server_final.starts_with("e="));
    }
}
