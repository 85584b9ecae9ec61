use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::dbbouncer::common::Result;

/// A single backend connection held by a [super::TenantPool]. Carries the PG
/// state a transaction-mode pool needs to restore between checkouts
/// (`server_params`, `backend_pid`/`backend_key` for cancel requests); MySQL
/// tenants leave those fields `None`/empty.
pub struct PooledConnection {
    pub stream: TcpStream,
    pub created_at: Instant,
    pub last_used: Instant,
    pub dial_duration: Duration,
    pub server_params: HashMap<String, String>,
    pub backend_pid: Option<i32>,
    pub backend_key: Option<i32>,
    pub authenticated: bool,
}

impl PooledConnection {
    pub fn new(stream: TcpStream, dial_duration: Duration) -> Self {
        let now = Instant::now();
        PooledConnection {
            stream,
            created_at: now,
            last_used: now,
            dial_duration,
            server_params: HashMap::new(),
            backend_pid: None,
            backend_key: None,
            authenticated: false,
        }
    }

    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        max_lifetime != Duration::ZERO && self.created_at.elapsed() >= max_lifetime
    }

    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        idle_timeout != Duration::ZERO && self.last_used.elapsed() >= idle_timeout
    }

    pub fn mark_active(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn mark_idle(&mut self) {
        self.last_used = Instant::now();
    }

    /// Best-effort liveness check: a zero-length non-blocking peek. A closed
    /// or reset socket returns `Ok(0)` or an error; either means the connection
    /// is dead and must not be returned to a waiter.
    pub async fn ping(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    pub async fn close(mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}
