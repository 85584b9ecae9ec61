use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::{PoolMode, TenantConfig};
use crate::dbbouncer::pool::PooledConnection;
use crate::dbbouncer::relay::pg_session::RelayContext;
use crate::dbbouncer::wire::mysql::handshake::{build_handshake_v10, generate_scramble, parse_handshake_response};
use crate::dbbouncer::wire::mysql::packet::{read_packet, write_packet};

/// MySQL equivalent of [crate::dbbouncer::relay::pg_session::handle_connection].
/// The wire framing differs (length-prefixed packets with a sequence byte
/// instead of tagged messages) but the admission and pooling decisions are
/// the same shape: resolve a tenant from the connecting username, check
/// routing/health, then either relay a real handshake (session mode) or hand
/// out a synthetic one (transaction mode).
#[tracing::instrument(name = "mysql_session", skip_all)]
pub async fn handle_connection(mut sock: TcpStream, ctx: Arc<RelayContext>) -> Result<()> {
    let scramble = generate_scramble();
    let handshake = build_handshake_v10(1, &scramble);
    write_packet(&mut sock, 0, &handshake).await?;

    let response_pkt = read_packet(&mut sock).await?;
    let response = parse_handshake_response(&response_pkt.payload)?;

    let (tenant_id, real_user) = match crate::dbbouncer::common::split_tenant_prefix(&response.username) {
        Some((t, u)) => (t.to_string(), u.to_string()),
        None => match &response.database {
            Some(db) => (db.clone(), response.username.clone()),
            None => {
                send_err(&mut sock, response_pkt.sequence_id + 1, 1045, "no tenant could be determined").await?;
                return Err(Error::admission("no tenant could be determined from mysql handshake"));
            }
        },
    };

    let tenant = match ctx.directory.resolve(&tenant_id) {
        Some(t) => t,
        None => {
            send_err(&mut sock, response_pkt.sequence_id + 1, 1045, "unknown tenant").await?;
            return Err(Error::admission("unknown tenant"));
        }
    };
    if ctx.directory.is_paused(&tenant_id) {
        send_err(&mut sock, response_pkt.sequence_id + 1, 1053, "tenant is paused").await?;
        return Err(Error::admission("tenant paused"));
    }
    if !ctx.health.is_healthy(&tenant_id) {
        send_err(&mut sock, response_pkt.sequence_id + 1, 1053, "tenant backend is currently unreachable").await?;
        return Err(Error::admission("tenant unhealthy"));
    }

    // The proxy never authenticates the connecting client itself: tenant
    // credentials are backend-only (see TenantConfig::password). The
    // HandshakeResponse41 captured above is only ever forwarded to, or
    // re-derived against, the real backend.

    let pool_settings = ctx.directory.defaults().resolve(&tenant.pool);
    match pool_settings.pool_mode {
        PoolMode::Session => run_session_mode(&mut sock, &ctx, &tenant_id, &response_pkt.payload).await,
        PoolMode::Transaction => run_transaction_mode(&mut sock, &ctx, &tenant_id, real_user.as_str(), &tenant, response_pkt.sequence_id + 1).await,
    }
}

async fn send_ok(sock: &mut TcpStream, seq: u8) -> Result<()> {
    // OK packet: header 0x00, affected rows/last insert id (both 0), status flags, warnings.
    let payload = vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
    write_packet(sock, seq, &payload).await
}

async fn send_err(sock: &mut TcpStream, seq: u8, code: u16, message: &str) -> Result<()> {
    let mut payload = vec![0xff];
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(b"HY000");
    payload.extend_from_slice(message.as_bytes());
    write_packet(sock, seq, &payload).await
}

/// Session mode never authenticates on the backend's behalf: it reads and
/// drops the backend's own initial handshake, forwards the client's captured
/// `HandshakeResponse41` bytes verbatim, then relays the backend's real auth
/// result back to the client with the backend's own sequence byte. Once that
/// relay starts the backend connection's protocol state is unknowable to the
/// proxy, so it is always closed afterward rather than returned to the pool.
async fn run_session_mode(sock: &mut TcpStream, ctx: &Arc<RelayContext>, tenant_id: &str, client_response: &[u8]) -> Result<()> {
    let pool = ctx.pools.get_or_create(tenant_id).await?;
    let mut conn = pool.acquire().await?;

    let _backend_handshake = read_packet(&mut conn.stream).await?;
    write_packet(&mut conn.stream, 1, client_response).await?;

    let auth_result = read_packet(&mut conn.stream).await?;
    write_packet(sock, auth_result.sequence_id, &auth_result.payload).await?;

    if auth_result.payload.first() == Some(&0xff) {
        ctx.pools.release(tenant_id, conn, false).await;
        return Err(Error::auth("backend rejected client during mysql session-mode handshake relay"));
    }

    let result = relay_bidirectional(sock, &mut conn.stream).await;
    if result.is_err() {
        ctx.metrics.incr_dirty_disconnects(tenant_id);
    }
    ctx.pools.release(tenant_id, conn, false).await;
    result
}

/// Transaction-pooling: the client never sees a real backend handshake.
/// An already-authenticated pooled connection is acquired and immediately
/// returned to the pool (authenticating it first, via a minimal
/// `mysql_native_password` exchange, if this is its first checkout), then a
/// synthetic `OK_Packet` stands in for the real one. A backend is checked out
/// per command afterward, with prepares/locks pinning the connection to this
/// client until it disconnects.
async fn run_transaction_mode(
    sock: &mut TcpStream,
    ctx: &Arc<RelayContext>,
    tenant_id: &str,
    _real_user: &str,
    tenant: &Arc<TenantConfig>,
    seq: u8,
) -> Result<()> {
    let pool = ctx.pools.get_or_create(tenant_id).await?;

    let mut initial = pool.acquire().await?;
    if !initial.authenticated {
        crate::dbbouncer::wire::mysql::authenticate_backend(&mut initial.stream, &tenant.username, &tenant.password, &tenant.database).await?;
        initial.authenticated = true;
    }
    ctx.pools.release(tenant_id, initial, true).await;

    send_ok(sock, seq).await?;

    let mut pinned: Option<PooledConnection> = None;
    let mut pin_depth: i32 = 0;

    loop {
        let pkt = match read_packet(sock).await {
            Ok(p) => p,
            Err(_) => break,
        };
        if pkt.payload.is_empty() {
            continue;
        }
        let command = pkt.payload[0];
        if command == 0x01 {
            break; // COM_QUIT
        }

        let mut conn = match pinned.take() {
            Some(c) => c,
            None => {
                let start = Instant::now();
                let mut c = pool.acquire().await?;
                if !c.authenticated {
                    crate::dbbouncer::wire::mysql::authenticate_backend(&mut c.stream, &tenant.username, &tenant.password, &tenant.database).await?;
                    c.authenticated = true;
                }
                ctx.metrics.observe_acquire_duration(tenant_id, start.elapsed());
                c
            }
        };

        if command == 0x1f {
            // COM_RESET_CONNECTION: reset and return immediately, no backend roundtrip needed.
            ctx.metrics.incr_backend_resets(tenant_id, "reset_connection");
            send_ok(sock, pkt.sequence_id + 1).await?;
            ctx.pools.release(tenant_id, conn, true).await;
            pin_depth = 0;
            continue;
        }

        if is_session_pin_command(command, &pkt.payload) {
            pin_depth += 1;
            ctx.metrics.incr_session_pins(tenant_id, "prepare_or_lock");
        }

        write_packet(&mut conn.stream, pkt.sequence_id, &pkt.payload).await?;
        let tx_start = Instant::now();
        relay_command_response(sock, &mut conn.stream).await?;
        ctx.metrics.observe_transaction_duration(tenant_id, tx_start.elapsed());

        if pin_depth > 0 {
            pinned = Some(conn);
        } else {
            ctx.pools.release(tenant_id, conn, true).await;
        }
    }

    if let Some(conn) = pinned {
        ctx.pools.release(tenant_id, conn, false).await;
    }
    Ok(())
}

/// COM_STMT_PREPARE, COM_SET_OPTION, and queries taking a named lock or
/// opening an explicit transaction all pin the backend to this client —
/// COM_STMT_CLOSE deliberately does NOT un-pin here, since a client can
/// legitimately close one statement while others remain open on the same
/// backend.
fn is_session_pin_command(command: u8, payload: &[u8]) -> bool {
    match command {
        0x16 | 0x1b => true, // COM_STMT_PREPARE, COM_SET_OPTION
        0x03 => {
            let sql = String::from_utf8_lossy(&payload[1..]).to_ascii_uppercase();
            sql.contains("GET_LOCK") || sql.contains("LOCK TABLES") || sql.contains("START TRANSACTION") || sql.contains("BEGIN")
        }
        _ => false,
    }
}

/// Forward backend packets to the client until the response for this command
/// is fully drained: an OK/EOF packet without `SERVER_MORE_RESULTS_EXISTS`
/// set, or an ERR packet.
async fn relay_command_response(client: &mut TcpStream, backend: &mut TcpStream) -> Result<()> {
    loop {
        let pkt = read_packet(backend).await?;
        let done = match pkt.payload.first() {
            Some(0xff) => true, // ERR
            Some(0x00) | Some(0xfe) if pkt.payload.len() >= 5 => {
                let status = u16::from_le_bytes([pkt.payload[pkt.payload.len() - 2], pkt.payload[pkt.payload.len() - 1]]);
                status & 0x0008 == 0 // SERVER_MORE_RESULTS_EXISTS
            }
            Some(0x00) | Some(0xfe) => true,
            _ => false, // result set row or column definition, more packets follow
        };
        write_packet(client, pkt.sequence_id, &pkt.payload).await?;
        if done {
            return Ok(());
        }
    }
}

async fn relay_bidirectional(client: &mut TcpStream, backend: &mut TcpStream) -> Result<()> {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut backend_rd, mut backend_wr) = backend.split();
    tokio::select! {
        r = tokio::io::copy(&mut client_rd, &mut backend_wr) => r.map(|_| ()).map_err(Error::from),
        r = tokio::io::copy(&mut backend_rd, &mut client_wr) => r.map(|_| ()).map_err(Error::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_pin_detects_prepare() {
        assert!(is_session_pin_command(0x16, b""));
    }

    #[test]
    fn test_session_pin_ignores_stmt_close() {
        assert!(!is_session_pin_command(0x19, b""));
    }

    #[test]
    fn test_session_pin_detects_get_lock_query() {
        let payload = [&[0x03][..], b"SELECT GET_LOCK('x', 1)"].concat();
        assert!(is_session_pin_command(0x03, &payload));
    }
}
