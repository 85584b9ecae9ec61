use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::info;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::{PoolMode, Settings};
use crate::dbbouncer::directory::RoutingDirectory;
use crate::dbbouncer::health::HealthMap;
use crate::dbbouncer::metrics::MetricsSink;
use crate::dbbouncer::pool::{PoolManager, PooledConnection};
use crate::dbbouncer::tls::TlsManager;
use crate::dbbouncer::wire::pg::codec::{
    build_admission_error, build_auth_ok, build_backend_key_data, build_parameter_status, build_ready_for_query,
    read_message, read_startup, write_message, write_raw, StartupRequest,
};
use crate::dbbouncer::wire::pg::{authenticate_backend, resolve_tenant_identity};
use crate::dbbouncer::wire::pg::tag::{SSL_ALLOWED, SSL_NOT_ALLOWED};

/// Either a plain or TLS-wrapped client socket. The relay loop doesn't care
/// which, since both implement `AsyncRead + AsyncWrite`.
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl tokio::io::AsyncRead for ClientStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ClientStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub struct RelayContext {
    pub directory: Arc<RoutingDirectory>,
    pub pools: Arc<PoolManager>,
    pub health: Arc<HealthMap>,
    pub metrics: Arc<dyn MetricsSink>,
    pub tls: Option<Arc<TlsManager>>,
    pub settings: Arc<Settings>,
}

/// Admit and serve a single client connection for its whole lifetime.
#[tracing::instrument(name = "pg_session", skip_all)]
pub async fn handle_connection(sock: TcpStream, ctx: Arc<RelayContext>) -> Result<()> {
    let (startup_params, raw_startup, mut stream) = negotiate_startup(sock, &ctx).await?;

    let identity = resolve_tenant_identity(&startup_params)
        .ok_or_else(|| Error::admission("no tenant could be determined from startup parameters"))?;

    let tenant = match ctx.directory.resolve(&identity.tenant_id) {
        Some(t) => t,
        None => {
            reject(&mut stream, &format!("unknown tenant {:?}", identity.tenant_id)).await?;
            return Err(Error::admission("unknown tenant"));
        }
    };
    if ctx.directory.is_paused(&identity.tenant_id) {
        reject(&mut stream, "tenant is paused").await?;
        return Err(Error::admission("tenant paused"));
    }
    if !ctx.health.is_healthy(&identity.tenant_id) {
        reject(&mut stream, "tenant backend is currently unreachable").await?;
        return Err(Error::admission("tenant unhealthy"));
    }

    let pool_settings = ctx.directory.defaults().resolve(&tenant.pool);

    match pool_settings.pool_mode {
        PoolMode::Session => run_session_mode(&mut stream, &ctx, &identity, &raw_startup).await,
        PoolMode::Transaction => run_transaction_mode(&mut stream, &ctx, &identity, &tenant).await,
    }
}

type StartupParams = std::collections::HashMap<String, String>;

async fn negotiate_startup(mut sock: TcpStream, ctx: &Arc<RelayContext>) -> Result<(StartupParams, Vec<u8>, ClientStream)> {
    for _attempt in 0..crate::dbbouncer::config::settings::MAX_SSL_ATTEMPTS {
        let req = read_startup(&mut sock).await?;
        match req {
            StartupRequest::SslRequest => {
                if let Some(tls) = &ctx.tls {
                    sock.write_all(&[SSL_ALLOWED]).await?;
                    let acceptor = tls.acceptor().await?;
                    let tls_stream = acceptor.accept(sock).await?;
                    return negotiate_after_tls(tls_stream).await;
                } else {
                    sock.write_all(&[SSL_NOT_ALLOWED]).await?;
                }
            }
            StartupRequest::GssEncRequest => {
                sock.write_all(&[SSL_NOT_ALLOWED]).await?;
            }
            StartupRequest::CancelRequest { .. } => return Err(Error::cancelled()),
            StartupRequest::Startup { params, raw, .. } => return Ok((params, raw, ClientStream::Plain(sock))),
        }
    }
    Err(Error::protocol("too many SSL negotiation attempts"))
}

async fn negotiate_after_tls(mut tls_stream: TlsStream<TcpStream>) -> Result<(StartupParams, Vec<u8>, ClientStream)> {
    let req = read_startup(&mut tls_stream).await?;
    match req {
        StartupRequest::Startup { params, raw, .. } => Ok((params, raw, ClientStream::Tls(Box::new(tls_stream)))),
        StartupRequest::CancelRequest { .. } => Err(Error::cancelled()),
        _ => Err(Error::protocol("unexpected SSL/GSS request over an already-TLS connection")),
    }
}

async fn reject(stream: &mut ClientStream, message: &str) -> Result<()> {
    let (tag, body) = build_admission_error(message);
    write_message(stream, tag, &body).await
}

/// Session-pooling: the client's own startup message is forwarded verbatim to
/// a freshly acquired backend and its real auth exchange is relayed through
/// to the client message-for-message — the proxy never sees the client's
/// credential, only shuttles bytes. Once the backend signals ReadyForQuery
/// (or fails with an ErrorResponse), the two sockets are spliced until either
/// side closes. The backend's protocol state afterward is unknowable, so it
/// is always closed rather than returned to the pool.
async fn run_session_mode(
    stream: &mut ClientStream,
    ctx: &Arc<RelayContext>,
    identity: &crate::dbbouncer::wire::pg::StartupIdentity,
    raw_startup: &[u8],
) -> Result<()> {
    let pool = ctx.pools.get_or_create(&identity.tenant_id).await?;
    let mut conn = pool.acquire().await?;

    write_raw(&mut conn.stream, raw_startup).await?;

    let auth_ok = match relay_auth_phase(stream, &mut conn.stream).await {
        Ok(ok) => ok,
        Err(e) => {
            ctx.pools.release(&identity.tenant_id, conn, false).await;
            return Err(e);
        }
    };
    if !auth_ok {
        ctx.pools.release(&identity.tenant_id, conn, false).await;
        return Err(Error::auth("backend rejected client during session-mode auth relay"));
    }
    info!(tenant = %identity.tenant_id, "client authenticated");

    let result = relay_bidirectional(stream, &mut conn.stream).await;
    if result.is_err() {
        ctx.metrics.incr_dirty_disconnects(&identity.tenant_id);
    }
    ctx.pools.release(&identity.tenant_id, conn, false).await;
    result
}

/// Forward the backend's handshake/auth messages to the client and route the
/// client's replies back to the backend. `AuthenticationSASL` and
/// `AuthenticationSASLContinue` each require one extra client round trip
/// beyond the single-shot cleartext/MD5 case; `AuthenticationSASLFinal`
/// does not, since the client never replies to it. Terminates on
/// `ReadyForQuery` (true) or `ErrorResponse` (false).
async fn relay_auth_phase(client: &mut ClientStream, backend: &mut TcpStream) -> Result<bool> {
    loop {
        let msg = read_message(backend).await?;
        write_message(client, msg.tag, &msg.body).await?;
        match msg.tag {
            b'E' => return Ok(false),
            b'Z' => return Ok(true),
            b'R' if msg.body.len() >= 4 => {
                let auth_type = i32::from_be_bytes([msg.body[0], msg.body[1], msg.body[2], msg.body[3]]);
                if matches!(auth_type, 3 | 5 | 10 | 11) {
                    let reply = read_message(client).await?;
                    write_message(backend, reply.tag, &reply.body).await?;
                }
            }
            _ => {}
        }
    }
}

/// Transaction-pooling: the client never sees a real backend handshake.
/// Instead an already-authenticated pooled connection is acquired, its
/// cached ParameterStatus/BackendKeyData are replayed to the client as a
/// synthetic auth-ok sequence, and the connection is immediately returned to
/// the pool — the client begins idle, holding no backend. A backend is then
/// checked out per transaction, with session pins (named prepared
/// statements, LISTEN) forcing the connection to stick with this client
/// until it disconnects.
async fn run_transaction_mode(
    stream: &mut ClientStream,
    ctx: &Arc<RelayContext>,
    identity: &crate::dbbouncer::wire::pg::StartupIdentity,
    tenant: &Arc<crate::dbbouncer::config::TenantConfig>,
) -> Result<()> {
    let pool = ctx.pools.get_or_create(&identity.tenant_id).await?;

    let mut initial = pool.acquire().await?;
    if !initial.authenticated {
        let result = authenticate_backend(&mut initial.stream, &tenant.username, &tenant.password, &tenant.database).await?;
        initial.server_params = result.server_params;
        initial.backend_pid = result.backend_pid;
        initial.backend_key = result.backend_key;
        initial.authenticated = true;
    }

    let (tag, body) = build_auth_ok();
    write_message(stream, tag, &body).await?;
    for (k, v) in &initial.server_params {
        let (tag, body) = build_parameter_status(k, v);
        write_message(stream, tag, &body).await?;
    }
    let (tag, body) = build_backend_key_data(initial.backend_pid.unwrap_or(0), initial.backend_key.unwrap_or(0));
    write_message(stream, tag, &body).await?;
    let (tag, body) = build_ready_for_query(b'I');
    write_message(stream, tag, &body).await?;
    ctx.pools.release(&identity.tenant_id, initial, true).await;

    let mut pinned: Option<PooledConnection> = None;

    loop {
        let msg = match read_message(stream).await {
            Ok(m) => m,
            Err(_) => break,
        };
        if msg.tag == b'X' {
            break;
        }

        let mut conn = match pinned.take() {
            Some(c) => c,
            None => {
                let acquire_start = Instant::now();
                let mut c = pool.acquire().await?;
                if !c.authenticated {
                    let result = authenticate_backend(&mut c.stream, &tenant.username, &tenant.password, &tenant.database).await?;
                    c.server_params = result.server_params;
                    c.backend_pid = result.backend_pid;
                    c.backend_key = result.backend_key;
                    c.authenticated = true;
                }
                ctx.metrics.observe_acquire_duration(&identity.tenant_id, acquire_start.elapsed());
                c
            }
        };

        write_message(&mut conn.stream, msg.tag, &msg.body).await?;

        let should_pin = is_session_pin_message(msg.tag, &msg.body);
        if should_pin {
            ctx.metrics.incr_session_pins(&identity.tenant_id, "named_statement_or_listen");
        }

        let tx_start = Instant::now();
        let transaction_done = relay_until_transaction_boundary(stream, &mut conn.stream).await?;
        ctx.metrics.observe_transaction_duration(&identity.tenant_id, tx_start.elapsed());

        if should_pin || !transaction_done {
            pinned = Some(conn);
        } else {
            reset_connection(&mut conn).await?;
            ctx.pools.release(&identity.tenant_id, conn, true).await;
        }
    }

    if let Some(conn) = pinned {
        ctx.pools.release(&identity.tenant_id, conn, false).await;
    }
    Ok(())
}

fn is_session_pin_message(tag: u8, body: &[u8]) -> bool {
    match tag {
        b'P' => true, // Parse of a named prepared statement
        b'Q' => {
            let sql = String::from_utf8_lossy(body).to_ascii_uppercase();
            sql.contains("LISTEN ") || sql.contains("SET SESSION") || sql.contains("PREPARE ")
        }
        _ => false,
    }
}

/// Forward backend responses to the client until a `ReadyForQuery` with
/// transaction status `Idle` arrives, meaning the transaction (or the
/// simple-query's implicit one) fully closed out.
async fn relay_until_transaction_boundary(
    client: &mut ClientStream,
    backend: &mut TcpStream,
) -> Result<bool> {
    loop {
        let msg = read_message(backend).await?;
        write_message(client, msg.tag, &msg.body).await?;
        if msg.tag == b'Z' {
            return Ok(msg.body.first() == Some(&b'I'));
        }
    }
}

async fn reset_connection(conn: &mut PooledConnection) -> Result<()> {
    write_message(&mut conn.stream, b'Q', b"DISCARD ALL\0").await?;
    loop {
        let msg = read_message(&mut conn.stream).await?;
        if msg.tag == b'Z' {
            return Ok(());
        }
    }
}

async fn relay_bidirectional(client: &mut ClientStream, backend: &mut TcpStream) -> Result<()> {
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = backend.split();
    tokio::select! {
        r = tokio::io::copy(&mut client_rd, &mut backend_wr) => r.map(|_| ()).map_err(Error::from),
        r = tokio::io::copy(&mut backend_rd, &mut client_wr) => r.map(|_| ()).map_err(Error::from),
    }
}
