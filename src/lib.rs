//! A pluggable TLS connection engine: handshake orchestration,
//! record-layer bridging, and private-key delegation for application
//! frameworks that need to drive a handshake themselves rather than hand
//! a raw socket to a higher-level client.
//!
//! The crate is organised around the same seams a BoringSSL-style
//! binding draws: a transport [`bio`], per-connection scratch state in
//! [`appdata`], a [`config`]urable long-lived context, a [`session`]
//! cache, re-entrant [`upcall`]s during the handshake, delegated private
//! keys in [`keywrap`], and the [`connection`] state machine that ties
//! all of it together behind either a blocking socket or a non-blocking
//! engine surface.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod alpn;
pub mod appdata;
pub mod bio;
pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod log;
pub mod keywrap;
pub mod sct;
pub mod session;
pub mod upcall;

pub use config::{
    default_trust_manager, single_cert_key_manager, ConnectionConfig, ConnectionConfigBuilder, KeyManager,
    TrustManager, VerifyMode,
};
pub use connection::{Connection, ConnState, EngineIoResult, EngineStatus, HandshakeStatus, HandshakeStep, Mode};
pub use error::{ActualThrow, Error, ErrorKind};
pub use keywrap::{EcdsaSigningKey, KeyExData, KeyWrapper, RsaPadding, RsaSigningKey};
pub use session::{Session, SessionCache};
pub use upcall::{CallbackSet, ClientCertChoice, DhGroup, HandshakeUpcallEnvironment, InfoWhere, TransientSession, UpcallError};
