//! Error taxonomy and the primitive-error-to-kind mapping.
//!
//! `rustls` (our "primitive library" collaborator) reports failures as
//! its own `rustls::Error`. We translate those, and the handful of
//! failures that originate in this crate's own glue code, into the
//! named kinds below, then let the pluggable `ActualThrow` hook have the
//! last word before anything crosses the public API.

use std::fmt;
use std::sync::Arc;

/// Abstract error kinds, covering I/O, argument validation, certificate
/// and key handling, and the handshake/protocol failures a TLS engine
/// needs to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Timeout,
    NullArgument,
    OutOfMemory,
    IllegalArgument,
    IllegalState,
    ArrayBounds,
    ParseError,
    InvalidKey,
    InvalidAlgorithmParameter,
    NoSuchAlgorithm,
    BadPadding,
    IllegalBlockSize,
    Signature,
    Ssl,
    SslProtocol,
    SslHandshake,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Arc<str>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn illegal_argument(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::IllegalArgument, message)
    }

    pub fn illegal_state(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::IllegalState, message)
    }

    pub fn array_bounds() -> Self {
        Self::new(ErrorKind::ArrayBounds, "array index out of bounds")
    }

    pub fn handshake(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::SslHandshake, message)
    }

    pub fn is_want_read_write(&self) -> bool {
        false
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Error::new(ErrorKind::Timeout, e.to_string())
        } else {
            Error::new(ErrorKind::Io, e.to_string())
        }
    }
}

/// Maps a `rustls::Error` onto the named kinds above.
///
/// `rustls` does not expose a BoringSSL-style `(library, reason)` error
/// queue; its `Error` enum already distinguishes the same concerns (bad
/// certificates, decode failures, peer-sent alerts, peer incompatibility),
/// so the mapping below keys off its variants instead of a
/// `(library, reason)` pair.
pub fn from_rustls(e: rustls::Error) -> Error {
    use rustls::Error as RE;
    let kind = match &e {
        RE::InappropriateMessage { .. } | RE::InappropriateHandshakeMessage { .. } => {
            ErrorKind::SslProtocol
        }
        RE::CorruptMessage | RE::CorruptMessagePayload(_) => ErrorKind::ParseError,
        RE::NoCertificatesPresented => ErrorKind::InvalidKey,
        RE::UnsupportedNameType => ErrorKind::IllegalArgument,
        RE::DecryptError => ErrorKind::BadPadding,
        RE::PeerIncompatible(_) | RE::PeerMisbehaved(_) => ErrorKind::SslProtocol,
        RE::AlertReceived(_) => ErrorKind::Ssl,
        RE::InvalidCertificate(_) => ErrorKind::InvalidKey,
        RE::General(_) => ErrorKind::Ssl,
        RE::FailedToGetCurrentTime | RE::FailedToGetRandomBytes => ErrorKind::OutOfMemory,
        RE::HandshakeNotComplete => ErrorKind::IllegalState,
        RE::PeerSentOversizedRecord => ErrorKind::SslProtocol,
        RE::NoApplicationProtocol => ErrorKind::SslHandshake,
        RE::BadMaxFragmentSize => ErrorKind::IllegalArgument,
        RE::InvalidMessage(_) => ErrorKind::ParseError,
        RE::EncryptError => ErrorKind::Ssl,
        _ => ErrorKind::Ssl,
    };
    Error::new(kind, e.to_string())
}

/// The pluggable "actualThrow" hook: lets a consumer specialise how a
/// translated error is finally surfaced (e.g. always report the
/// handshake-error kind while a handshake is in flight).
pub type ActualThrow = Arc<dyn Fn(Error) -> Error + Send + Sync>;

pub fn default_actual_throw() -> ActualThrow {
    Arc::new(|e| e)
}
