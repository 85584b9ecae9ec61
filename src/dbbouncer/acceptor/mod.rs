use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::dbbouncer::common::Result;
use crate::dbbouncer::config::settings::LISTEN_BACKLOG;

/// Wraps a `TcpListener`, retrying on the handful of `accept()` errors that
/// are transient (hit a file-descriptor limit, interrupted syscall) rather
/// than fatal, matching the accept-loop error taxonomy used elsewhere in the
/// stack for raw socket work.
pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(address: String) -> Result<Self> {
        let listener = TcpListener::bind(&address).await?;
        debug!(address = %address, backlog = LISTEN_BACKLOG, "listening");
        Ok(Listener { address, listener })
    }

    pub async fn accept(&self) -> Option<(TcpStream, std::net::SocketAddr)> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    let _ = sock.set_nodelay(true);
                    return Some((sock, remote_addr));
                }
                Err(e) => {
                    match e.raw_os_error() {
                        Some(libc::ECONNABORTED) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
                        | Some(libc::ENOMEM) | Some(libc::EPROTO) | Some(libc::EINTR) => {
                            error!(error = %e, address = %self.address, "accept error, retrying");
                            continue;
                        }
                        _ => {
                            warn!(error = %e, address = %self.address, "fatal accept error, shutting down listener");
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Caps the number of proxy-accepted client connections across both
/// protocols. `0` disables the cap (matches `Settings::max_proxy_connections`
/// semantics).
pub struct ConnectionLimiter {
    max: u32,
    current: AtomicU32,
}

impl ConnectionLimiter {
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(ConnectionLimiter { max, current: AtomicU32::new(0) })
    }

    /// Try to reserve a connection slot. Returns a guard that releases it on
    /// drop, or `None` if the limiter is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        if self.max == 0 {
            return Some(ConnectionSlot { limiter: None });
        }
        loop {
            let cur = self.current.load(Ordering::Relaxed);
            if cur >= self.max {
                return None;
            }
            if self.current.compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return Some(ConnectionSlot { limiter: Some(self.clone()) });
            }
        }
    }
}

pub struct ConnectionSlot {
    limiter: Option<Arc<ConnectionLimiter>>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(limiter) = &self.limiter {
            limiter.current.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_admits() {
        let limiter = ConnectionLimiter::new(0);
        let _a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
    }

    #[test]
    fn test_limiter_rejects_past_capacity() {
        let limiter = ConnectionLimiter::new(1);
        let a = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        drop(a);
        assert!(limiter.try_acquire().is_some());
    }
}
