use sha1::{Digest, Sha1};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::wire::mysql::packet::{read_lenenc_int, read_nul_terminated, write_lenenc_int};

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;

const SERVER_CAPABILITIES: u32 =
    CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH | CLIENT_CONNECT_WITH_DB;

/// A 20-byte scramble the proxy generates for a synthetic handshake.
pub fn generate_scramble() -> [u8; 20] {
    use rand::RngCore;
    let mut scramble = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut scramble);
    // Neither byte 0 nor the separator the wire format null-terminates on can
    // appear inside the scramble.
    for b in scramble.iter_mut() {
        if *b == 0 {
            *b = 1;
        }
    }
    scramble
}

/// Build a synthetic protocol-v10 initial handshake packet the proxy sends to
/// a client in transaction-pooling mode (where there's no real backend
/// connection yet to relay one from).
pub fn build_handshake_v10(connection_id: u32, scramble: &[u8; 20]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(0x0a);
    buf.extend_from_slice(b"8.0.34-dbbouncer\0");
    buf.extend_from_slice(&connection_id.to_le_bytes());
    buf.extend_from_slice(&scramble[..8]);
    buf.push(0);
    buf.extend_from_slice(&(SERVER_CAPABILITIES as u16).to_le_bytes());
    buf.push(0xff); // utf8mb4_general_ci-ish placeholder charset id used widely by proxies
    buf.extend_from_slice(&0x0002u16.to_le_bytes()); // SERVER_STATUS_AUTOCOMMIT
    buf.extend_from_slice(&((SERVER_CAPABILITIES >> 16) as u16).to_le_bytes());
    buf.push(21); // auth-plugin-data length
    buf.extend_from_slice(&[0u8; 10]);
    buf.extend_from_slice(&scramble[8..]);
    buf.push(0);
    buf.extend_from_slice(b"mysql_native_password\0");
    buf
}

/// The scramble carried in a real server's initial handshake packet: the
/// first 8 bytes sit right after the server version/connection id/a filler
/// byte, the remaining 12 after the capability/charset/status fields.
pub fn parse_initial_handshake_scramble(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.is_empty() || buf[0] != 0x0a {
        return Err(Error::protocol("unsupported mysql handshake protocol version"));
    }
    let (_version, pos) = read_nul_terminated(buf, 1).ok_or_else(|| Error::protocol("missing server version"))?;
    let pos = pos + 4; // connection id
    let scramble_1 = buf.get(pos..pos + 8).ok_or_else(|| Error::protocol("short initial handshake"))?;
    let pos = pos + 8 + 1; // scramble part 1 + filler
    let pos = pos + 2 + 1 + 2 + 2 + 1 + 10; // capability lower, charset, status, capability upper, auth-plugin-data len, reserved
    let scramble_2_len = 12; // 21-byte plugin data total, minus the 8 already read and a trailing nul
    let scramble_2 = buf.get(pos..pos + scramble_2_len).ok_or_else(|| Error::protocol("short initial handshake auth data"))?;
    let mut scramble = Vec::with_capacity(20);
    scramble.extend_from_slice(scramble_1);
    scramble.extend_from_slice(scramble_2);
    Ok(scramble)
}

/// Build a `HandshakeResponse41` the proxy sends as a client authenticating
/// itself to a real backend, using `mysql_native_password`.
pub fn build_handshake_response41(username: &str, password: &str, database: &str, scramble: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SERVER_CAPABILITIES.to_le_bytes());
    buf.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes()); // max packet size
    buf.push(0xff); // charset, matches the synthetic handshake's placeholder
    buf.extend_from_slice(&[0u8; 23]); // reserved
    buf.extend_from_slice(username.as_bytes());
    buf.push(0);

    let auth_response = mysql_native_password(password, scramble);
    write_lenenc_int(&mut buf, auth_response.len() as u64);
    buf.extend_from_slice(&auth_response);

    buf.extend_from_slice(database.as_bytes());
    buf.push(0);
    buf.extend_from_slice(b"mysql_native_password\0");
    buf
}

pub struct HandshakeResponse {
    pub capabilities: u32,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
}

pub fn parse_handshake_response(buf: &[u8]) -> Result<HandshakeResponse> {
    if buf.len() < 32 {
        return Err(Error::protocol("short HandshakeResponse41"));
    }
    let capabilities = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::protocol("client does not support protocol 4.1"));
    }
    let mut pos = 32;
    let (username_bytes, next) =
        read_nul_terminated(buf, pos).ok_or_else(|| Error::protocol("missing username in HandshakeResponse41"))?;
    let username = String::from_utf8_lossy(username_bytes).to_string();
    pos = next;

    let auth_response = if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let (len, next) =
            read_lenenc_int(buf, pos).ok_or_else(|| Error::protocol("missing auth-response length"))?;
        let len = len as usize;
        let data = buf.get(next..next + len).ok_or_else(|| Error::protocol("truncated auth-response"))?;
        pos = next + len;
        data.to_vec()
    } else {
        let (data, next) = read_nul_terminated(buf, pos).ok_or_else(|| Error::protocol("missing auth-response"))?;
        pos = next;
        data.to_vec()
    };

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        read_nul_terminated(buf, pos).map(|(d, _)| String::from_utf8_lossy(d).to_string())
    } else {
        None
    };

    Ok(HandshakeResponse { capabilities, username, auth_response, database })
}

/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`, the
/// `mysql_native_password` challenge-response algorithm.
pub fn mysql_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

pub fn verify_native_password(password: &str, scramble: &[u8], response: &[u8]) -> bool {
    if response.is_empty() && password.is_empty() {
        return true;
    }
    mysql_native_password(password, scramble) == response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_password_is_deterministic() {
        let scramble = [1u8; 20];
        let a = mysql_native_password("hunter2", &scramble);
        let b = mysql_native_password("hunter2", &scramble);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_verify_native_password() {
        let scramble = generate_scramble();
        let response = mysql_native_password("hunter2", &scramble);
        assert!(verify_native_password("hunter2", &scramble, &response));
        assert!(!verify_native_password("wrong", &scramble, &response));
    }

    #[test]
    fn test_generated_scramble_has_no_nul_bytes() {
        let scramble = generate_scramble();
        assert!(!scramble.iter().any(|&b| b == 0));
    }

    #[test]
    fn test_parse_initial_handshake_scramble_matches_build() {
        let scramble = generate_scramble();
        let handshake = build_handshake_v10(7, &scramble);
        let parsed = parse_initial_handshake_scramble(&handshake).unwrap();
        assert_eq!(parsed, scramble.to_vec());
    }

    #[test]
    fn test_handshake_response41_authenticates_against_scramble() {
        let scramble = generate_scramble();
        let response = build_handshake_response41("alice", "hunter2", "acme", &scramble);
        let parsed = parse_handshake_response(&response).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.database.as_deref(), Some("acme"));
        assert!(verify_native_password("hunter2", &scramble, &parsed.auth_response));
    }
}
