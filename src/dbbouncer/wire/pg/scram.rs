use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::dbbouncer::common::{escape_scram_name, Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Client-side state machine for SCRAM-SHA-256 (RFC 5802 / RFC 7677), used when
/// dialing a backend that requires it. We only ever play the client role —
/// the proxy never needs to verify a SCRAM exchange as a server, since client
/// authentication against the proxy itself uses cleartext/MD5 (see the
/// component design doc).
pub struct ScramClient {
    user: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    salted_password: Option<[u8; 32]>,
    auth_message: String,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce: String = {
            let mut rng = rand::thread_rng();
            let bytes: [u8; 18] = rng.gen();
            base64::encode(bytes)
        };
        ScramClient {
            user: user.to_string(),
            password: password.to_string(),
            client_nonce: nonce,
            client_first_bare: String::new(),
            salted_password: None,
            auth_message: String::new(),
        }
    }

    pub fn client_first_message(&mut self) -> String {
        self.client_first_bare = format!("n={},r={}", escape_scram_name(&self.user), self.client_nonce);
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume the server-first message (`r=...,s=...,i=...`), derive the
    /// salted password, and return the client-final message (without waiting
    /// for the server's verification — that happens in
    /// `verify_server_final`).
    pub fn client_final_message(&mut self, server_first: &str) -> Result<String> {
        let fields = parse_fields(server_first);
        let combined_nonce = fields.get("r").ok_or_else(|| Error::auth("SCRAM server-first missing nonce"))?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::auth("SCRAM server nonce does not extend client nonce"));
        }
        let salt_b64 = fields.get("s").ok_or_else(|| Error::auth("SCRAM server-first missing salt"))?;
        let iterations: u32 = fields
            .get("i")
            .ok_or_else(|| Error::auth("SCRAM server-first missing iteration count"))?
            .parse()
            .map_err(|_| Error::auth("SCRAM server-first has non-numeric iteration count"))?;
        let salt = base64::decode(salt_b64).map_err(|_| Error::auth("SCRAM salt is not valid base64"))?;

        // RFC 5802 mandates SASLprep (RFC 4013) normalization of the password
        // before it's used as PBKDF2 input. Passwords with no special
        // characters pass through unchanged; `saslprep` only errs on
        // prohibited codepoints (e.g. unassigned Unicode), in which case we
        // fall back to the raw bytes rather than failing the login outright.
        let normalized = stringprep::saslprep(&self.password).unwrap_or_else(|_| self.password.as_str().into());
        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(normalized.as_bytes(), &salt, iterations, &mut salted_password);
        self.salted_password = Some(salted_password);

        let channel_binding = base64::encode(b"n,,");
        let client_final_without_proof = format!("c={},r={}", channel_binding, combined_nonce);
        self.auth_message =
            format!("{},{},{}", self.client_first_bare, server_first, client_final_without_proof);

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac_sha256(&stored_key, self.auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key.iter().zip(client_signature.iter()).map(|(a, b)| a ^ b).collect();

        Ok(format!("{},p={}", client_final_without_proof, base64::encode(client_proof)))
    }

    /// Verify the server's `v=...` signature against our own computed
    /// ServerSignature. Returns an error on mismatch — this is the step that
    /// actually authenticates the *server* to the client, preventing a
    /// man-in-the-middle from forging a successful login.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let fields = parse_fields(server_final);
        if let Some(err) = fields.get("e") {
            return Err(Error::auth(format!("SCRAM server signaled error: {}", err)));
        }
        let server_signature_b64 =
            fields.get("v").ok_or_else(|| Error::auth("SCRAM server-final missing verifier"))?;
        let salted_password = self.salted_password.ok_or_else(|| Error::auth("SCRAM final before client-final"))?;
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, self.auth_message.as_bytes());
        let expected_b64 = base64::encode(expected);
        if expected_b64 != *server_signature_b64 {
            return Err(Error::auth("SCRAM server signature verification failed"));
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn parse_fields(msg: &str) -> std::collections::HashMap<&str, &str> {
    msg.split(',')
        .filter_map(|kv| {
            let mut it = kv.splitn(2, '=');
            Some((it.next()?, it.next()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_first_message_format() {
        let mut client = ScramClient::new("alice", "pw");
        let msg = client.client_first_message();
        assert!(msg.starts_with("n,,n=alice,r="));
    }

    #[test]
    fn test_escaped_username_in_client_first() {
        let mut client = ScramClient::new("a=b,c", "pw");
        let msg = client.client_first_message();
        assert!(msg.contains("n=a=3Db=2Cc"));
    }

    #[test]
    fn test_rejects_non_extending_server_nonce() {
        let mut client = ScramClient::new("alice", "pw");
        client.client_first_message();
        let bogus_server_first = "r=totally-different,s=AAAA,i=4096";
        assert!(client.client_final_message(bogus_server_first).is_err());
    }
}
