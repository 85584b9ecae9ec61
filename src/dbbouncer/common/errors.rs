use std::fmt::Display;
use std::{fmt, io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;

/// The kind of failure behind an [Error], matching the taxonomy the error handling
/// design uses to decide whether to emit a protocol-conforming error frame, close
/// silently, or (for background tasks) just log and keep running.
#[derive(Debug)]
pub enum ErrorKind {
    /// Socket read/write failure, EOF, closed pipe.
    Io(io::Error),
    /// Malformed frame, length out of range, unexpected message type, SSL attempts exhausted.
    Protocol(String),
    /// Backend auth failure: SCRAM mismatch, unsupported auth type, MySQL ERR on handshake.
    Auth(String),
    /// No tenant, unknown tenant, paused tenant, unhealthy tenant.
    Admission(String),
    /// Pool closed, acquire timeout, dial failure.
    Pool(PoolErrorKind),
    /// Context cancellation / shutdown.
    Cancelled,
    /// Config validation failure. Only produced at load time.
    ConfigInvalid(String),
    PoisonError,
    ClosedError,
    StringError(String),
    YamlError(serde_yaml::Error),
    TlsError(rustls::Error),
    Utf8Error(std::str::Utf8Error),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PoolErrorKind {
    Closed,
    AcquireTimeout,
    DialFailure,
}

#[derive(Debug)]
pub struct Error {
    kind: Box<ErrorKind>, // boxed to keep Result small
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error { kind: Box::new(ErrorKind::StringError(s.to_string())) }
    }

    pub fn protocol<S: ToString>(s: S) -> Self {
        Error { kind: Box::new(ErrorKind::Protocol(s.to_string())) }
    }

    pub fn auth<S: ToString>(s: S) -> Self {
        Error { kind: Box::new(ErrorKind::Auth(s.to_string())) }
    }

    pub fn admission<S: ToString>(s: S) -> Self {
        Error { kind: Box::new(ErrorKind::Admission(s.to_string())) }
    }

    pub fn config_invalid<S: ToString>(s: S) -> Self {
        Error { kind: Box::new(ErrorKind::ConfigInvalid(s.to_string())) }
    }

    pub fn pool_closed() -> Self {
        Error { kind: Box::new(ErrorKind::Pool(PoolErrorKind::Closed)) }
    }

    pub fn acquire_timeout() -> Self {
        Error { kind: Box::new(ErrorKind::Pool(PoolErrorKind::AcquireTimeout)) }
    }

    pub fn dial_failure() -> Self {
        Error { kind: Box::new(ErrorKind::Pool(PoolErrorKind::DialFailure)) }
    }

    pub fn cancelled() -> Self {
        Error { kind: Box::new(ErrorKind::Cancelled) }
    }

    pub fn closed() -> Self {
        Error { kind: Box::new(ErrorKind::ClosedError) }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_pool(&self) -> bool {
        matches!(*self.kind, ErrorKind::Pool(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.kind, ErrorKind::Cancelled)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::new(err)
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::new(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error { kind: Box::new(ErrorKind::Io(err)) }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error { kind: Box::new(ErrorKind::YamlError(err)) }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error { kind: Box::new(ErrorKind::Utf8Error(err)) }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error { kind: Box::new(ErrorKind::PoisonError) }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error { kind: Box::new(ErrorKind::TlsError(err)) }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.kind, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Io(e) => Display::fmt(e, f),
            ErrorKind::Protocol(s) => write!(f, "protocol error: {}", s),
            ErrorKind::Auth(s) => write!(f, "auth error: {}", s),
            ErrorKind::Admission(s) => f.write_str(s),
            ErrorKind::Pool(k) => Display::fmt(k, f),
            ErrorKind::Cancelled => f.write_str("operation cancelled"),
            ErrorKind::ConfigInvalid(s) => write!(f, "invalid config: {}", s),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::ClosedError => f.write_str("socket/pool is closed"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::YamlError(e) => Display::fmt(e, f),
            ErrorKind::TlsError(e) => Display::fmt(e, f),
            ErrorKind::Utf8Error(e) => Display::fmt(e, f),
        }
    }
}

impl Display for PoolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolErrorKind::Closed => f.write_str("pool is closed"),
            PoolErrorKind::AcquireTimeout => f.write_str("timed out waiting to acquire a connection"),
            PoolErrorKind::DialFailure => f.write_str("failed to dial backend"),
        }
    }
}

impl std::error::Error for Error {}
