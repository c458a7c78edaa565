//! SCRAM client/server round trips driven entirely through the public
//! API (spec §8), one per supported hash algorithm, plus the documented
//! failure paths (wrong password, replayed nonce, tampered proof).

use xmpp_core::scram::client::{PasswordRetriever, ScramClient, ScramClientError};
use xmpp_core::scram::server::{ScramServer, ServerCredentials};
use xmpp_core::scram::ScramAlgorithm;

fn full_exchange(algorithm: ScramAlgorithm, password: &str, client_password: &str) -> Result<(), ()> {
    let creds = ServerCredentials::from_password(algorithm, password).map_err(|_| ())?;
    let mut client = ScramClient::new(algorithm, "user");
    let client_creds = PasswordRetriever(client_password.to_string());
    let mut server = ScramServer::new(algorithm);

    let client_first = client.respond(&client_creds).map_err(|_| ())?;
    let server_first = server.accept_client_first(&client_first, &creds).map_err(|_| ())?;

    client.accept_challenge(&client_creds, &server_first).map_err(|_| ())?;
    let client_final = client.respond(&client_creds).map_err(|_| ())?;

    let server_final = server.accept_client_final(&client_final, &creds).map_err(|_| ())?;
    if !server_final.starts_with("v=") {
        return Err(());
    }
    client.accept_final(&server_final).map_err(|_| ())
}

#[test]
fn sha1_full_exchange_succeeds() {
    assert!(full_exchange(ScramAlgorithm::Sha1, "pencil", "pencil").is_ok());
}

#[test]
fn sha256_full_exchange_succeeds() {
    assert!(full_exchange(ScramAlgorithm::Sha256, "pencil", "pencil").is_ok());
}

#[test]
fn sha512_full_exchange_succeeds() {
    assert!(full_exchange(ScramAlgorithm::Sha512, "pencil", "pencil").is_ok());
}

#[test]
fn wrong_password_is_rejected_by_the_client() {
    assert!(full_exchange(ScramAlgorithm::Sha1, "pencil", "not-pencil").is_err());
}

#[test]
fn client_detects_a_tampered_server_signature() {
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

    let mut tampered = server_final.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });

    assert!(matches!(
        client.accept_final(&tampered),
        Err(ScramClientError::Authentication(_))
    ));
}

#[test]
fn server_rejects_a_replayed_nonce_as_other_error() {
    let algo = ScramAlgorithm::Sha1;
    let creds = ServerCredentials::from_password(algo, "pencil").unwrap();
    let mut client = ScramClient::new(algo, "user");
    let client_creds = PasswordRetriever("pencil".to_string());
    let mut server = ScramServer::new(algo);

    let client_first = client.respond(&client_creds).unwrap();
    server.accept_client_first(&client_first, &creds).unwrap();

    let forged_final = "c=biws,r=stale-nonce,p=AAAA";
    let result = server.accept_client_final(forged_final, &creds).unwrap();
    assert!(result.starts_with("e="));
}

#[test]
fn mechanism_name_selection_prefers_the_strongest_offered() {
    for (offered, expected) in [
        (vec!["SCRAM-SHA-1"], ScramAlgorithm::Sha1),
        (vec!["SCRAM-SHA-1", "SCRAM-SHA-256"], ScramAlgorithm::Sha256),
        (
            vec!["SCRAM-SHA-1", "SCRAM-SHA-256", "SCRAM-SHA-512"],
            ScramAlgorithm::Sha512,
        ),
    ] {
        let chosen = [ScramAlgorithm::Sha512, ScramAlgorithm::Sha256, ScramAlgorithm::Sha1]
            .into_iter()
            .find(|algo| offered.iter().any(|m| *m == algo.mechanism_name()))
            .unwrap();
        assert_eq!(chosen, expected);
    }
}
