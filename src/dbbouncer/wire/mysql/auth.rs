use tokio::io::{AsyncRead, AsyncWrite};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::wire::mysql::handshake::{build_handshake_response41, parse_initial_handshake_scramble};
use crate::dbbouncer::wire::mysql::packet::{read_packet, write_packet};

/// Perform the client side of MySQL backend authentication: read the real
/// initial handshake, answer it with a `mysql_native_password`
/// `HandshakeResponse41`, and check the backend's auth result. Used to
/// authenticate transaction-mode pooled connections at dial time.
pub async fn authenticate_backend<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    username: &str,
    password: &str,
    database: &str,
) -> Result<()> {
    let handshake = read_packet(stream).await?;
    let scramble = parse_initial_handshake_scramble(&handshake.payload)?;

    let response = build_handshake_response41(username, password, database, &scramble);
    write_packet(stream, handshake.sequence_id + 1, &response).await?;

    let result = read_packet(stream).await?;
    match result.payload.first() {
        Some(0x00) | Some(0xfe) => Ok(()),
        Some(0xff) => Err(Error::auth(parse_err_message(&result.payload))),
        _ => Err(Error::protocol("unexpected mysql backend auth response")),
    }
}

fn parse_err_message(payload: &[u8]) -> String {
    if payload.len() > 9 {
        String::from_utf8_lossy(&payload[9..]).to_string()
    } else {
        "backend returned an error".to_string()
    }
}
