//! SCRAM (RFC 5802) — key derivation, message framing, and the client
//! and server state machines built on top of it.

pub mod client;
pub mod mechanism;
pub mod server;

pub use client::{CredentialRetriever, PasswordRetriever, ScramClient, ScramClientError, ScramClientState};
pub use mechanism::ScramAlgorithm;
pub use server::{ScramServer, ScramServerError, ScramServerState, ServerCredentials};
