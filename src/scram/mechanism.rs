//! Pure SCRAM (RFC 5802) cryptography and message framing.
//!
//! Everything here is a pure function over byte slices and `&str`s — no
//! I/O, no state. [`super::client::ScramClient`] and
//! [`super::server::ScramServer`] are the stateful layers built on top.

use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// One member of the SCRAM-SHA-* family: the hash/HMAC primitive plus the
/// name it is advertised under (`"SCRAM-" + algorithm-name`).
pub trait ScramHash {
    /// e.g. `"SHA-256"` — the mechanism name is `SCRAM-SHA-256`.
    const ALGORITHM_NAME: &'static str;

    fn hash(data: &[u8]) -> Vec<u8>;
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

macro_rules! impl_scram_hash {
    ($ty:ident, $digest:ty, $name:literal) => {
        pub struct $ty;

        impl ScramHash for $ty {
            const ALGORITHM_NAME: &'static str = $name;

            fn hash(data: &[u8]) -> Vec<u8> {
                <$digest as Digest>::digest(data).to_vec()
            }

            fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
                let mut mac = Hmac::<$digest>::new_from_slice(key)
                    .expect("HMAC accepts a key of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }

            fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
                let mut out = vec![0u8; <$digest as Digest>::output_size()];
                pbkdf2_hmac::<$digest>(password, salt, iterations, &mut out);
                out
            }
        }
    };
}

impl_scram_hash!(ScramSha1, Sha1, "SHA-1");
impl_scram_hash!(ScramSha256, Sha256, "SHA-256");
impl_scram_hash!(ScramSha512, Sha512, "SHA-512");

/// `(hash, hmac, algorithm-name)` descriptor — spec §3 "SCRAM mechanism
/// descriptor". The advertised SASL mechanism name is `"SCRAM-" + name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramAlgorithm {
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Sha1 => ScramSha1::ALGORITHM_NAME,
            Self::Sha256 => ScramSha256::ALGORITHM_NAME,
            Self::Sha512 => ScramSha512::ALGORITHM_NAME,
        }
    }

    pub fn mechanism_name(&self) -> String {
        format!("SCRAM-{}", self.algorithm_name())
    }

    pub fn from_mechanism_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA-1" => Some(Self::Sha1),
            "SCRAM-SHA-256" => Some(Self::Sha256),
            "SCRAM-SHA-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => ScramSha1::hash(data),
            Self::Sha256 => ScramSha256::hash(data),
            Self::Sha512 => ScramSha512::hash(data),
        }
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => ScramSha1::hmac(key, data),
            Self::Sha256 => ScramSha256::hmac(key, data),
            Self::Sha512 => ScramSha512::hmac(key, data),
        }
    }

    /// `Hi(data, salt, iterations)` — PBKDF2-HMAC keyed on `data`.
    /// `U1 = HMAC(data, salt || 0x00000001)`, `Ui = HMAC(data, Ui-1)`,
    /// result is `U1 XOR U2 XOR … XOR Un`, which is exactly PBKDF2-HMAC
    /// with block index 1 and `dkLen` = hash output length.
    pub fn hi(&self, data: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, MechanismError> {
        if iterations < 1 {
            return Err(MechanismError::Malformed("iteration count must be >= 1".into()));
        }
        Ok(match self {
            Self::Sha1 => ScramSha1::pbkdf2(data, salt, iterations),
            Self::Sha256 => ScramSha256::pbkdf2(data, salt, iterations),
            Self::Sha512 => ScramSha512::pbkdf2(data, salt, iterations),
        })
    }

    pub fn salted_password(
        &self,
        password_utf8: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> Result<Vec<u8>, MechanismError> {
        self.hi(password_utf8, salt, iterations)
    }

    pub fn client_key(&self, salted_password: &[u8]) -> Vec<u8> {
        self.hmac(salted_password, b"Client Key")
    }

    pub fn stored_key(&self, client_key: &[u8]) -> Vec<u8> {
        self.hash(client_key)
    }

    pub fn server_key(&self, salted_password: &[u8]) -> Vec<u8> {
        self.hmac(salted_password, b"Server Key")
    }

    pub fn client_signature(&self, stored_key: &[u8], auth_message: &str) -> Vec<u8> {
        self.hmac(stored_key, auth_message.as_bytes())
    }

    pub fn server_signature(&self, server_key: &[u8], auth_message: &str) -> Vec<u8> {
        self.hmac(server_key, auth_message.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MechanismError {
    #[error("malformed SCRAM message: {0}")]
    Malformed(String),
}

/// XOR two equal-length byte strings (`ClientProof = ClientKey XOR
/// ClientSignature`).
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Escapes a username per RFC 5802 §5.1: `=` -> `=3D`, `,` -> `=2C`.
pub fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// `gs2-header`: `"n,,"` with no authzid, `"n,a=<authzid>,"` otherwise.
/// Channel binding is explicitly unsupported (spec Non-goals), so the
/// gs2 cbind-flag is always `n`.
pub fn gs2_header(authzid: Option<&str>) -> String {
    match authzid {
        Some(authzid) => format!("n,a={authzid},"),
        None => "n,,".to_string(),
    }
}

/// `client-first-message-bare`: `n=<escaped-user>,r=<nonce>`.
pub fn client_first_bare(username: &str, nonce: &str) -> String {
    format!("n={},r={nonce}", escape_username(username))
}

/// `client-final-message-without-proof`: `c=<base64 gs2-header>,r=<nonce>`.
pub fn client_final_without_proof(gs2_header: &str, full_nonce: &str) -> String {
    format!("c={},r={full_nonce}", B64.encode(gs2_header.as_bytes()))
}

/// `AuthMessage = client-first-bare + "," + server-first + "," +
/// client-final-without-proof`.
pub fn auth_message(
    client_first_bare: &str,
    server_first: &str,
    client_final_without_proof: &str,
) -> String {
    format!("{client_first_bare},{server_first},{client_final_without_proof}")
}

pub fn base64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>, MechanismError> {
    B64.decode(data).map_err(|e| MechanismError::Malformed(format!("invalid base64: {e}")))
}

/// A parsed SCRAM message: `key=value` pairs split on `,`, with
/// duplicate keys rejected as malformed. A leading `gs2-header`-shaped
/// prefix (`cbind-flag,authzid-or-empty,`) is synthesized into the
/// pseudo-key `"gs2-header"` when present, per spec §4.2.
#[derive(Debug, Clone, Default)]
pub struct ScramMessage {
    pairs: Vec<(char, String)>,
}

impl ScramMessage {
    /// Parses a server-first or server-final message (no gs2-header
    /// prefix — those only appear on the client-first message).
    pub fn parse(raw: &str) -> Result<Self, MechanismError> {
        let mut pairs = Vec::new();
        for part in raw.split(',') {
            let mut splitter = part.splitn(2, '=');
            let key = splitter.next().unwrap_or("");
            let value = splitter
                .next()
                .ok_or_else(|| MechanismError::Malformed(format!("attribute without value: {part}")))?;
            let key_char = key
                .chars()
                .next()
                .filter(|_| key.len() == 1)
                .ok_or_else(|| MechanismError::Malformed(format!("invalid attribute key: {key}")))?;
            if pairs.iter().any(|(k, _)| *k == key_char) {
                return Err(MechanismError::Malformed(format!("duplicate key: {key}")));
            }
            pairs.push((key_char, value.to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: char) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: char) -> bool {
        self.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5802 Appendix B vector.
    const USER: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const SERVER_NONCE_SUFFIX: &str = "3rfcNHYJY1ZVvWVs7j";
    const SALT_B64: &str = "QSXCR+Q6sek8bf92";
    const ITERATIONS: u32 = 4096;

    #[test]
    fn rfc5802_full_exchange() {
        let algo = ScramAlgorithm::Sha1;
        let full_nonce = format!("{CLIENT_NONCE}{SERVER_NONCE_SUFFIX}");
        let salt = base64_decode(SALT_B64).unwrap();

        let c_first_bare = client_first_bare(USER, CLIENT_NONCE);
        assert_eq!(c_first_bare, "n=user,r=fyko+d2lbbFgONRv9qkxdawL");

        let server_first = format!("r={full_nonce},s={SALT_B64},i={ITERATIONS}");

        let c_final_without_proof = client_final_without_proof(&gs2_header(None), &full_nonce);
        assert_eq!(
            c_final_without_proof,
            format!("c=biws,r={full_nonce}")
        );

        let salted_password = algo.salted_password(PASSWORD.as_bytes(), &salt, ITERATIONS).unwrap();
        let client_key = algo.client_key(&salted_password);
        let stored_key = algo.stored_key(&client_key);
        let server_key = algo.server_key(&salted_password);

        let msg = auth_message(&c_first_bare, &server_first, &c_final_without_proof);
        let client_signature = algo.client_signature(&stored_key, &msg);
        let client_proof = xor(&client_key, &client_signature);
        let client_final = format!("{c_final_without_proof},p={}", base64_encode(&client_proof));
        assert_eq!(
            client_final,
            format!("c=biws,r={full_nonce},p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=")
        );

        let server_signature = algo.server_signature(&server_key, &msg);
        assert_eq!(base64_encode(&server_signature), "rmF9pqV8S7suAoZWja4dJRkFsKQ=");
    }

    #[test]
    fn hi_matches_pbkdf2_hmac_reference() {
        let salt = base64_decode(SALT_B64).unwrap();
        let expected = {
            let mut out = vec![0u8; 20];
            pbkdf2_hmac::<Sha1>(PASSWORD.as_bytes(), &salt, ITERATIONS, &mut out);
            out
        };
        let actual = ScramAlgorithm::Sha1.hi(PASSWORD.as_bytes(), &salt, ITERATIONS).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn hi_rejects_zero_iterations() {
        assert!(ScramAlgorithm::Sha1.hi(b"pw", b"salt", 0).is_err());
    }

    #[test]
    fn username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }

    #[test]
    fn message_parse_rejects_duplicate_keys() {
        assert!(ScramMessage::parse("r=x,s=y,r=z").is_err());
    }

    #[test]
    fn message_parse_rejects_missing_value() {
        assert!(ScramMessage::parse("r").is_err());
    }

    #[test]
    fn message_parse_reads_fields() {
        let msg = ScramMessage::parse("r=abc,s=ZGVm,i=4096").unwrap();
        assert_eq!(msg.get('r'), Some("abc"));
        assert_eq!(msg.get('s'), Some("ZGVm"));
        assert_eq!(msg.get('i'), Some("4096"));
        assert!(!msg.has('e'));
    }

    #[test]
    fn mechanism_name_round_trips() {
        for algo in [ScramAlgorithm::Sha1, ScramAlgorithm::Sha256, ScramAlgorithm::Sha512] {
            let name = algo.mechanism_name();
            assert_eq!(ScramAlgorithm::from_mechanism_name(&name), Some(algo));
        }
    }
}
