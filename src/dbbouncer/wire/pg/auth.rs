use std::collections::HashMap;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::wire::pg::codec::{read_message, write_raw};
use crate::dbbouncer::wire::pg::scram::ScramClient;

pub struct BackendAuthResult {
    pub server_params: HashMap<String, String>,
    pub backend_pid: Option<i32>,
    pub backend_key: Option<i32>,
}

/// Hex-encoded `md5` + md5(md5(password + user) + salt), per the Postgres
/// frontend/backend protocol's AuthenticationMD5Password algorithm.
pub fn hash_md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex::encode(hasher.finalize_reset());
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    let outer = hasher.finalize();
    format!("md5{}", hex::encode(outer))
}

fn build_startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut params = Vec::new();
    params.extend_from_slice(b"user\0");
    params.extend_from_slice(user.as_bytes());
    params.push(0);
    params.extend_from_slice(b"database\0");
    params.extend_from_slice(database.as_bytes());
    params.push(0);
    params.push(0);

    let mut msg = Vec::with_capacity(8 + params.len());
    msg.extend_from_slice(&((8 + params.len()) as i32).to_be_bytes());
    msg.extend_from_slice(&196608i32.to_be_bytes());
    msg.extend_from_slice(&params);
    msg
}

/// Perform the client side of PG backend authentication: send Startup, answer
/// whichever AuthenticationXXX challenge the backend sends (cleartext, MD5, or
/// SCRAM-SHA-256), then drain ParameterStatus/BackendKeyData up to
/// ReadyForQuery.
pub async fn authenticate_backend<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
    database: &str,
) -> Result<BackendAuthResult> {
    write_raw(stream, &build_startup_message(user, database)).await?;

    loop {
        let msg = read_message(stream).await?;
        match msg.tag {
            b'E' => return Err(Error::auth(parse_error_message(&msg.body))),
            b'R' => {
                if msg.body.len() < 4 {
                    return Err(Error::protocol("short authentication message"));
                }
                let auth_type = i32::from_be_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]);
                match auth_type {
                    0 => continue, // AuthenticationOk, proceed to drain ParameterStatus etc below
                    3 => {
                        send_password(stream, password).await?;
                    }
                    5 => {
                        if msg.body.len() != 8 {
                            return Err(Error::protocol("malformed AuthenticationMD5Password"));
                        }
                        let salt = [msg.body[4], msg.body[5], msg.body[6], msg.body[7]];
                        let hashed = hash_md5_password(user, password, salt);
                        send_password(stream, &hashed).await?;
                    }
                    10 => {
                        run_scram(stream, user, password, &msg.body[4..]).await?;
                    }
                    other => return Err(Error::auth(format!("unsupported backend auth type {}", other))),
                }
                return drain_until_ready(stream).await;
            }
            other => return Err(Error::protocol(format!("unexpected message tag '{}' during auth", other as char))),
        }
    }
}

async fn send_password<S: AsyncWrite + Unpin>(stream: &mut S, password: &str) -> Result<()> {
    let mut body = Vec::with_capacity(password.len() + 1);
    body.extend_from_slice(password.as_bytes());
    body.push(0);
    crate::dbbouncer::wire::pg::codec::write_message(stream, b'p', &body).await
}

async fn run_scram<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
    mechanisms_buf: &[u8],
) -> Result<()> {
    let mechanisms = parse_cstring_list(mechanisms_buf);
    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
        return Err(Error::auth("backend does not support SCRAM-SHA-256"));
    }

    let mut client = ScramClient::new(user, password);
    let client_first = client.client_first_message();

    let mut body = Vec::new();
    body.extend_from_slice(b"SCRAM-SHA-256\0");
    body.extend_from_slice(&(client_first.len() as i32).to_be_bytes());
    body.extend_from_slice(client_first.as_bytes());
    crate::dbbouncer::wire::pg::codec::write_message(stream, b'p', &body).await?;

    let msg = read_message(stream).await?;
    if msg.tag != b'R' || msg.body.len() < 4 {
        return Err(Error::protocol("expected AuthenticationSASLContinue"));
    }
    let auth_type = i32::from_be_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]);
    if auth_type != 11 {
        return Err(Error::auth("expected AuthenticationSASLContinue"));
    }
    let server_first = std::str::from_utf8(&msg.body[4..])?;
    let client_final = client.client_final_message(server_first)?;
    crate::dbbouncer::wire::pg::codec::write_message(stream, b'p', client_final.as_bytes()).await?;

    let msg = read_message(stream).await?;
    if msg.tag == b'E' {
        return Err(Error::auth(parse_error_message(&msg.body)));
    }
    if msg.tag != b'R' || msg.body.len() < 4 {
        return Err(Error::protocol("expected AuthenticationSASLFinal"));
    }
    let auth_type = i32::from_be_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]);
    if auth_type != 12 {
        return Err(Error::auth("expected AuthenticationSASLFinal"));
    }
    let server_final = std::str::from_utf8(&msg.body[4..])?;
    client.verify_server_final(server_final)?;
    Ok(())
}

fn parse_cstring_list(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0).filter(|s| !s.is_empty()).map(|s| String::from_utf8_lossy(s).to_string()).collect()
}

fn parse_error_message(body: &[u8]) -> String {
    for field in body.split(|&b| b == 0) {
        if field.first() == Some(&b'M') {
            return String::from_utf8_lossy(&field[1..]).to_string();
        }
    }
    "backend returned an error".to_string()
}

async fn drain_until_ready<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BackendAuthResult> {
    let mut server_params = HashMap::new();
    let mut backend_pid = None;
    let mut backend_key = None;
    loop {
        let msg = read_message(stream).await?;
        match msg.tag {
            b'R' => continue, // trailing AuthenticationOk
            b'S' => {
                let mut it = msg.body.split(|&b| b == 0);
                if let (Some(k), Some(v)) = (it.next(), it.next()) {
                    server_params.insert(String::from_utf8_lossy(k).to_string(), String::from_utf8_lossy(v).to_string());
                }
            }
            b'K' => {
                if msg.body.len() == 8 {
                    backend_pid = Some(i32::from_be_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]));
                    backend_key = Some(i32::from_be_bytes([msg.body[4], msg.body[5], msg.body[6], msg.body[7]]));
                }
            }
            b'Z' => return Ok(BackendAuthResult { server_params, backend_pid, backend_key }),
            b'E' => return Err(Error::auth(parse_error_message(&msg.body))),
            b'N' => continue,
            other => return Err(Error::protocol(format!("unexpected message tag '{}' before ReadyForQuery", other as char))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_md5_password() {
        assert_eq!(
            hash_md5_password("username", "foobar", 0xa26892c4u32.to_be_bytes()),
            "md57b4e445f6041af0d6d962d0cbd830f18"
        );
        assert_eq!(
            hash_md5_password("md5_user", "password", 0x2a3d8fe0u32.to_be_bytes()),
            "md562af4dd09bbb41884907a838a3233294"
        );
    }
}
