use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::wire::pg::error_codes;
use crate::dbbouncer::wire::pg::tag::{CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, SSL_REQUEST_CODE};

/// Largest startup message. Postgres itself has no hard cap, but an
/// unbounded allocation driven by an attacker-controlled length prefix is a
/// denial-of-service vector, so the proxy enforces one.
pub const MAX_STARTUP_LEN: usize = 10_000;

/// Largest body of a regular (post-startup) protocol message: `2^24`.
pub const MAX_MESSAGE_LEN: usize = 1 << 24;

/// A regular (post-startup) protocol message: one tag byte followed by a
/// 4-byte big-endian length (itself included) and the body.
pub struct Message {
    pub tag: u8,
    pub body: Vec<u8>,
}

pub enum StartupRequest {
    /// `raw` is the complete original wire message (length prefix + payload),
    /// kept so session-mode relay can forward it to the backend verbatim.
    Startup { protocol_version: i32, params: HashMap<String, String>, raw: Vec<u8> },
    SslRequest,
    GssEncRequest,
    CancelRequest { backend_pid: i32, backend_key: i32 },
}

/// Read the very first message on a new connection, which lacks the tag byte
/// every subsequent message has.
pub async fn read_startup<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<StartupRequest> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);
    if len < 8 || len as usize > MAX_STARTUP_LEN {
        return Err(Error::protocol(format!("invalid startup message length {}", len)));
    }
    let mut rest = vec![0u8; (len as usize) - 4];
    stream.read_exact(&mut rest).await?;

    let code = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupRequest::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if rest.len() != 12 {
                return Err(Error::protocol("malformed CancelRequest"));
            }
            let backend_pid = i32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
            let backend_key = i32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]);
            Ok(StartupRequest::CancelRequest { backend_pid, backend_key })
        }
        protocol_version => {
            let params = parse_cstring_pairs(&rest[4..])?;
            let mut raw = Vec::with_capacity(4 + rest.len());
            raw.extend_from_slice(&len_buf);
            raw.extend_from_slice(&rest);
            Ok(StartupRequest::Startup { protocol_version, params, raw })
        }
    }
}

fn parse_cstring_pairs(buf: &[u8]) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut pos = 0;
    loop {
        if pos >= buf.len() {
            break;
        }
        if buf[pos] == 0 {
            break;
        }
        let (key, next) = read_cstring(buf, pos)?;
        let (value, next) = read_cstring(buf, next)?;
        if !key.is_empty() {
            params.insert(key, value);
        }
        pos = next;
    }
    Ok(params)
}

fn read_cstring(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let end = buf[start..].iter().position(|&b| b == 0).ok_or_else(|| Error::protocol("unterminated string"))?;
    let s = std::str::from_utf8(&buf[start..start + end])?.to_string();
    Ok((s, start + end + 1))
}

pub async fn read_message<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<Message> {
    let mut tag_buf = [0u8; 1];
    stream.read_exact(&mut tag_buf).await?;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(Error::protocol(format!("invalid message length {} for tag {}", len, tag_buf[0] as char)));
    }
    let mut body = vec![0u8; (len as usize) - 4];
    stream.read_exact(&mut body).await?;
    Ok(Message { tag: tag_buf[0], body })
}

pub async fn write_message<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, tag: u8, body: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(tag);
    frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    Ok(())
}

pub async fn write_raw<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await?;
    Ok(())
}

fn push_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub fn build_auth_ok() -> (u8, Vec<u8>) {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&0i32.to_be_bytes());
    (b'R', body)
}

pub fn build_parameter_status(name: &str, value: &str) -> (u8, Vec<u8>) {
    let mut body = Vec::new();
    push_cstring(&mut body, name);
    push_cstring(&mut body, value);
    (b'S', body)
}

pub fn build_backend_key_data(pid: i32, key: i32) -> (u8, Vec<u8>) {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(&key.to_be_bytes());
    (b'K', body)
}

pub fn build_ready_for_query(status: u8) -> (u8, Vec<u8>) {
    (b'Z', vec![status])
}

pub fn build_error_response(severity: &str, code: &str, message: &str) -> (u8, Vec<u8>) {
    let mut body = Vec::new();
    body.push(b'S');
    push_cstring(&mut body, severity);
    body.push(b'V');
    push_cstring(&mut body, severity);
    body.push(b'C');
    push_cstring(&mut body, code);
    body.push(b'M');
    push_cstring(&mut body, message);
    body.push(0);
    (b'E', body)
}

pub fn build_admission_error(message: &str) -> (u8, Vec<u8>) {
    build_error_response("FATAL", error_codes::CANNOT_CONNECT_NOW, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_startup_params_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&196608i32.to_be_bytes());
        buf.extend_from_slice(b"user\0alice\0database\0acme\0\0");
        let mut framed = Vec::new();
        framed.extend_from_slice(&((buf.len() + 4) as i32).to_be_bytes());
        framed.extend_from_slice(&buf);

        let mut cursor = std::io::Cursor::new(framed.clone());
        let req = read_startup(&mut cursor).await.unwrap();
        match req {
            StartupRequest::Startup { protocol_version, params, raw } => {
                assert_eq!(protocol_version, 196608);
                assert_eq!(params.get("user").map(String::as_str), Some("alice"));
                assert_eq!(params.get("database").map(String::as_str), Some("acme"));
                assert_eq!(raw, framed);
            }
            _ => panic!("expected Startup"),
        }
    }

    #[tokio::test]
    async fn test_ssl_request_recognized() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&8i32.to_be_bytes());
        framed.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let mut cursor = std::io::Cursor::new(framed);
        let req = read_startup(&mut cursor).await.unwrap();
        assert!(matches!(req, StartupRequest::SslRequest));
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let mut buf = Vec::new();
        write_message(&mut buf, b'Q', b"SELECT 1").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let msg = read_message(&mut cursor).await.unwrap();
        assert_eq!(msg.tag, b'Q');
        assert_eq!(msg.body, b"SELECT 1");
    }
}
