//! Long-lived connection configuration: cipher list, verification mode,
//! session cache, and the callbacks/hooks a caller installs once.
//!
//! `ConnectionConfig` is owned by the consumer for the lifetime of
//! potentially many connections; connections take a shared (`Arc`)
//! reference whose lifetime must not outlive the config's owner. Built
//! once via [`ConnectionConfigBuilder`] -- expensive to build, meant to
//! be built once per process and reused.

use std::sync::Arc;

use crate::error::{default_actual_throw, ActualThrow, Error, ErrorKind};
use crate::session::SessionCache;

/// Peer-verification strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Peer,
    RequirePeer,
}

/// Maximum length of a session id context.
pub const MAX_SESSION_ID_CONTEXT_LEN: usize = 32;

/// Trust-manager handle: decides whether a presented peer chain is
/// acceptable. Path building and revocation policy stay out of scope;
/// this type only ever answers accept-or-reject for a chain it is handed.
pub type TrustManager = Arc<dyn rustls::client::ServerCertVerifier>;

/// Key-manager handle: chooses a local certificate/key for server-side
/// client-auth requests.
pub type KeyManager = Arc<dyn rustls::server::ResolvesServerCert>;

/// The Mozilla root program bundled via `webpki-roots`, wrapped as a
/// [`TrustManager`]. Installed by default so a caller that never sets an
/// explicit trust manager still gets a real chain-of-trust check (subject
/// to `verify_mode`) rather than silently trusting nothing; a caller with
/// its own PKI overrides it with `ConnectionConfigBuilder::trust_manager`.
pub fn default_trust_manager() -> TrustManager {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    Arc::new(rustls::client::WebPkiVerifier::new(roots, None))
}

/// A [`KeyManager`] that always resolves to one fixed certificate chain
/// and private key -- the common case for a server that doesn't need
/// per-SNI selection. `key_der` may be PKCS#8, SEC1, or PKCS#1; the actual
/// signing scheme is detected from the key bytes themselves.
pub fn single_cert_key_manager(cert_chain_der: Vec<Vec<u8>>, key_der: Vec<u8>) -> Result<KeyManager, Error> {
    let certs = cert_chain_der.into_iter().map(rustls::Certificate).collect();
    let signing_key = rustls::sign::any_supported_type(&rustls::PrivateKey(key_der))
        .map_err(|e| Error::new(ErrorKind::InvalidKey, format!("unsupported private key: {e}")))?;
    Ok(Arc::new(FixedCertResolver {
        key: Arc::new(rustls::sign::CertifiedKey::new(certs, signing_key)),
    }))
}

struct FixedCertResolver {
    key: Arc<rustls::sign::CertifiedKey>,
}

impl std::fmt::Debug for FixedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCertResolver").finish()
    }
}

impl rustls::server::ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

/// Long-lived configuration shared by every connection built from it.
pub struct ConnectionConfig {
    enabled_protocols: Vec<String>,
    enabled_cipher_suites: Vec<String>,
    session_id_context: Vec<u8>,
    session_cache: Arc<SessionCache>,
    signed_cert_timestamp: Vec<u8>,
    ocsp_response: Vec<u8>,
    client_ca_names: Vec<Vec<u8>>,
    psk_identity_hint: Option<String>,
    verify_mode: VerifyMode,
    trust_manager: Option<TrustManager>,
    key_manager: Option<KeyManager>,
    need_client_auth: bool,
    want_client_auth: bool,
    session_creation_enabled: bool,
    channel_id_enabled: bool,
    sni_hostname: Option<String>,
    alpn_protocols: Vec<u8>,
    actual_throw: ActualThrow,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    pub fn enabled_protocols(&self) -> &[String] {
        &self.enabled_protocols
    }

    /// Ordered enabled-cipher-suite list. An empty input list is accepted
    /// at configuration time without error, even though it guarantees a
    /// handshake failure later.
    pub fn enabled_cipher_suites(&self) -> &[String] {
        &self.enabled_cipher_suites
    }

    pub fn session_id_context(&self) -> &[u8] {
        &self.session_id_context
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.session_cache
    }

    pub fn signed_cert_timestamp(&self) -> &[u8] {
        &self.signed_cert_timestamp
    }

    pub fn ocsp_response(&self) -> &[u8] {
        &self.ocsp_response
    }

    pub fn client_ca_names(&self) -> &[Vec<u8>] {
        &self.client_ca_names
    }

    pub fn psk_identity_hint(&self) -> Option<&str> {
        self.psk_identity_hint.as_deref()
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    pub fn trust_manager(&self) -> Option<&TrustManager> {
        self.trust_manager.as_ref()
    }

    pub fn key_manager(&self) -> Option<&KeyManager> {
        self.key_manager.as_ref()
    }

    pub fn need_client_auth(&self) -> bool {
        self.need_client_auth
    }

    pub fn want_client_auth(&self) -> bool {
        self.want_client_auth
    }

    pub fn session_creation_enabled(&self) -> bool {
        self.session_creation_enabled
    }

    pub fn channel_id_enabled(&self) -> bool {
        self.channel_id_enabled
    }

    pub fn sni_hostname(&self) -> Option<&str> {
        self.sni_hostname.as_deref()
    }

    pub fn alpn_protocols(&self) -> &[u8] {
        &self.alpn_protocols
    }

    /// The pluggable "actualThrow" hook: gives the final say over how a
    /// translated error is surfaced.
    pub fn raise(&self, err: Error) -> Error {
        (self.actual_throw)(err)
    }
}

/// Builder for [`ConnectionConfig`]; `Arc` drop handles what would
/// otherwise be an explicit `free`.
pub struct ConnectionConfigBuilder {
    enabled_protocols: Vec<String>,
    enabled_cipher_suites: Vec<String>,
    session_id_context: Vec<u8>,
    session_cache: Arc<SessionCache>,
    signed_cert_timestamp: Vec<u8>,
    ocsp_response: Vec<u8>,
    client_ca_names: Vec<Vec<u8>>,
    psk_identity_hint: Option<String>,
    verify_mode: VerifyMode,
    trust_manager: Option<TrustManager>,
    key_manager: Option<KeyManager>,
    need_client_auth: bool,
    want_client_auth: bool,
    session_creation_enabled: bool,
    channel_id_enabled: bool,
    sni_hostname: Option<String>,
    alpn_protocols: Vec<u8>,
    actual_throw: ActualThrow,
}

/// The untouched-default enabled-cipher-suite list: every suite name
/// `rustls` implements, behind the always-present `!SSLv2` exclusion.
/// Distinct from `.enabled_cipher_suites(Vec::new())`, which names no
/// suite at all and is meant to -- the difference between "caller never
/// restricted anything" and "caller explicitly enabled nothing" has to
/// survive into `Connection`'s cipher-suite translation, or an untouched
/// config could never negotiate a cipher suite.
fn default_enabled_cipher_suites() -> Vec<String> {
    let mut suites = vec!["!SSLv2".to_string()];
    suites.extend(
        rustls::ALL_CIPHER_SUITES
            .iter()
            .filter_map(|s| s.suite().as_str())
            .map(str::to_string),
    );
    suites
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self {
            enabled_protocols: vec!["TLSv1.2".to_string()],
            // `!SSLv2` is always prepended to the enabled-suite list,
            // rejecting SSLv2 explicitly regardless of what the caller
            // requests; the rest of the default names every suite
            // `rustls` implements (see `default_enabled_cipher_suites`).
            enabled_cipher_suites: default_enabled_cipher_suites(),
            session_id_context: Vec::new(),
            session_cache: Arc::new(SessionCache::default()),
            signed_cert_timestamp: Vec::new(),
            ocsp_response: Vec::new(),
            client_ca_names: Vec::new(),
            psk_identity_hint: None,
            verify_mode: VerifyMode::None,
            trust_manager: Some(default_trust_manager()),
            key_manager: None,
            need_client_auth: false,
            want_client_auth: false,
            session_creation_enabled: true,
            channel_id_enabled: false,
            sni_hostname: None,
            alpn_protocols: Vec::new(),
            actual_throw: default_actual_throw(),
        }
    }

    pub fn enabled_protocols(mut self, protocols: Vec<String>) -> Self {
        self.enabled_protocols = protocols;
        self
    }

    /// `!SSLv2` stays pinned as the first entry no matter what the
    /// caller passes; an empty `suites` is legal and simply yields an
    /// enabled-cipher set with nothing else in it.
    pub fn enabled_cipher_suites(mut self, suites: Vec<String>) -> Self {
        let mut list = vec!["!SSLv2".to_string()];
        list.extend(suites.into_iter().filter(|s| s != "!SSLv2"));
        self.enabled_cipher_suites = list;
        self
    }

    pub fn session_id_context(mut self, bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() > MAX_SESSION_ID_CONTEXT_LEN {
            return Err(Error::new(
                ErrorKind::IllegalArgument,
                format!("session id context longer than {MAX_SESSION_ID_CONTEXT_LEN} bytes"),
            ));
        }
        self.session_id_context = bytes;
        Ok(self)
    }

    pub fn session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.session_cache = cache;
        self
    }

    pub fn signed_cert_timestamp(mut self, bytes: Vec<u8>) -> Self {
        self.signed_cert_timestamp = bytes;
        self
    }

    pub fn ocsp_response(mut self, bytes: Vec<u8>) -> Self {
        self.ocsp_response = bytes;
        self
    }

    pub fn client_ca_names(mut self, names: Vec<Vec<u8>>) -> Self {
        self.client_ca_names = names;
        self
    }

    pub fn psk_identity_hint(mut self, hint: impl Into<String>) -> Self {
        self.psk_identity_hint = Some(hint.into());
        self
    }

    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    pub fn trust_manager(mut self, manager: TrustManager) -> Self {
        self.trust_manager = Some(manager);
        self
    }

    pub fn key_manager(mut self, manager: KeyManager) -> Self {
        self.key_manager = Some(manager);
        self
    }

    pub fn need_client_auth(mut self, value: bool) -> Self {
        self.need_client_auth = value;
        self
    }

    pub fn want_client_auth(mut self, value: bool) -> Self {
        self.want_client_auth = value;
        self
    }

    pub fn session_creation_enabled(mut self, value: bool) -> Self {
        self.session_creation_enabled = value;
        self
    }

    pub fn channel_id_enabled(mut self, value: bool) -> Self {
        self.channel_id_enabled = value;
        self
    }

    pub fn sni_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.sni_hostname = Some(hostname.into());
        self
    }

    /// Takes an already length-prefix-encoded ALPN byte sequence; use
    /// [`crate::alpn::encode_protocol_list`] to build it from a plain
    /// protocol-name list.
    pub fn alpn_protocols(mut self, encoded: Vec<u8>) -> Self {
        self.alpn_protocols = encoded;
        self
    }

    pub fn actual_throw(mut self, hook: ActualThrow) -> Self {
        self.actual_throw = hook;
        self
    }

    pub fn build(self) -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            enabled_protocols: self.enabled_protocols,
            enabled_cipher_suites: self.enabled_cipher_suites,
            session_id_context: self.session_id_context,
            session_cache: self.session_cache,
            signed_cert_timestamp: self.signed_cert_timestamp,
            ocsp_response: self.ocsp_response,
            client_ca_names: self.client_ca_names,
            psk_identity_hint: self.psk_identity_hint,
            verify_mode: self.verify_mode,
            trust_manager: self.trust_manager,
            key_manager: self.key_manager,
            need_client_auth: self.need_client_auth,
            want_client_auth: self.want_client_auth,
            session_creation_enabled: self.session_creation_enabled,
            channel_id_enabled: self.channel_id_enabled,
            sni_hostname: self.sni_hostname,
            alpn_protocols: self.alpn_protocols,
            actual_throw: self.actual_throw,
        })
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sslv2_sentinel_always_prepended() {
        let config = ConnectionConfig::builder()
            .enabled_cipher_suites(vec!["TLS_AES_128_GCM_SHA256".to_string()])
            .build();
        assert_eq!(config.enabled_cipher_suites()[0], "!SSLv2");
    }

    #[test]
    fn empty_cipher_list_is_accepted_at_configuration_time() {
        let config = ConnectionConfig::builder()
            .enabled_cipher_suites(Vec::new())
            .build();
        assert_eq!(config.enabled_cipher_suites(), &["!SSLv2".to_string()]);
    }

    #[test]
    fn session_id_context_over_32_bytes_is_illegal_argument() {
        let err = ConnectionConfig::builder()
            .session_id_context(vec![0u8; 33])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn session_id_context_at_32_bytes_is_accepted() {
        let builder = ConnectionConfig::builder()
            .session_id_context(vec![0u8; 32])
            .unwrap();
        let config = builder.build();
        assert_eq!(config.session_id_context().len(), 32);
    }
}
