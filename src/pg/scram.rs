//! SCRAM-SHA-256 authentication flow.
//!
//! RFC 5802 (SCRAM) with the SHA-256 parameters of RFC 7677, as spoken by
//! PostgreSQL's SASL exchange. The flow advances through three messages:
//! client-first, client-final (after the server's challenge), and server
//! signature verification.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Per-connection SCRAM exchange state.
pub struct ScramFlow {
    username: String,
    password: String,
    client_nonce: String,
    stage: Stage,
}

enum Stage {
    Fresh,
    AwaitingChallenge,
    AwaitingSignature {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

impl ScramFlow {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes, base64 to 24 printable chars.
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            stage: Stage::Fresh,
        }
    }

    /// The SASLInitialResponse payload, `n,,n=<user>,r=<nonce>`.
    pub fn client_first(&mut self) -> Vec<u8> {
        self.stage = Stage::AwaitingChallenge;
        format!("n,,{}", self.first_bare()).into_bytes()
    }

    fn first_bare(&self) -> String {
        // PostgreSQL is lenient about SASLprep; usernames pass through as-is.
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Consume the server-first challenge, produce the client-final payload.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        if !matches!(self.stage, Stage::AwaitingChallenge) {
            return Err(Error::Auth("SCRAM exchange out of order".to_string()));
        }
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| Error::Auth("malformed SCRAM challenge".to_string()))?;

        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| Error::Auth("bad SCRAM salt".to_string()))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| Error::Auth("bad SCRAM iteration count".to_string()))?,
                );
            }
        }
        let combined_nonce =
            combined_nonce.ok_or_else(|| Error::Auth("missing SCRAM nonce".to_string()))?;
        let salt = salt.ok_or_else(|| Error::Auth("missing SCRAM salt".to_string()))?;
        let iterations =
            iterations.ok_or_else(|| Error::Auth("missing SCRAM iterations".to_string()))?;

        // The server must echo our nonce as a prefix.
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::Auth("SCRAM nonce mismatch".to_string()));
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!("{},{},{}", self.first_bare(), server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = [0u8; 32];
        for (out, (a, b)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *out = a ^ b;
        }

        self.stage = Stage::AwaitingSignature {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify the server's `v=` signature from AuthenticationSASLFinal.
    pub fn verify_server(&mut self, server_final: &[u8]) -> Result<()> {
        let (salted_password, auth_message) = match &self.stage {
            Stage::AwaitingSignature {
                salted_password,
                auth_message,
            } => (*salted_password, auth_message.clone()),
            _ => return Err(Error::Auth("SCRAM exchange out of order".to_string())),
        };

        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| Error::Auth("malformed SCRAM signature".to_string()))?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("missing SCRAM server signature".to_string()))?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| Error::Auth("bad SCRAM server signature".to_string()))?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if signature != expected {
            return Err(Error::Auth(
                "server signature verification failed".to_string(),
            ));
        }
        self.stage = Stage::Done;
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_shape() {
        let mut flow = ScramFlow::new("user", "pencil");

        let first = String::from_utf8(flow.client_first()).unwrap();
        assert!(first.starts_with("n,,n=user,r="));

        let client_nonce = first.split("r=").nth(1).unwrap().to_string();
        let server_first = format!(
            "r={}SRVNONCE,s={},i=4096",
            client_nonce,
            BASE64.encode(b"salt1234salt1234")
        );

        let finale = String::from_utf8(flow.client_final(server_first.as_bytes()).unwrap()).unwrap();
        assert!(finale.starts_with("c=biws,r="));
        assert!(finale.contains(",p="));
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut flow = ScramFlow::new("user", "pw");
        let _ = flow.client_first();
        let server_first = format!("r=NOTOURS,s={},i=4096", BASE64.encode(b"salt"));
        assert!(flow.client_final(server_first.as_bytes()).is_err());
    }

    #[test]
    fn test_out_of_order_calls_fail() {
        let mut flow = ScramFlow::new("user", "pw");
        assert!(flow.client_final(b"r=x,s=eA==,i=1").is_err());
        assert!(flow.verify_server(b"v=eA==").is_err());
    }
}
