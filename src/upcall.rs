//! Handshake upcall router.
//!
//! The boundary across which the primitive library (`rustls`) calls back
//! into caller code *during* a handshake step. Every upcall is bracketed
//! by [`AppData`]'s mutex: install the environment, make the call, record
//! the outcome, clear the environment -- never a thread-local proxy.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::log::{trace, warn};

/// `where`-mask bits passed to [`CallbackSet::info_state_change`],
/// mirroring the primitive library's `SSL_CB_*` constants closely enough
/// to be useful without depending on its numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoWhere(pub u32);

impl InfoWhere {
    pub const HANDSHAKE_START: u32 = 0x01;
    pub const HANDSHAKE_DONE: u32 = 0x02;
    pub const LOOP: u32 = 0x04;
    pub const ALERT: u32 = 0x08;
    pub const EXIT: u32 = 0x10;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// A key-type/issuer-list certificate request answered during
/// `client_certificate_requested`. `None` means "continue without client
/// authentication".
pub type ClientCertChoice = Option<Arc<rustls::sign::CertifiedKey>>;

/// A transient view of the in-progress peer chain, valid only for the
/// duration of a `verify_certificate_chain` call: the handshake session
/// handle is non-null only during a verify upcall.
pub struct TransientSession<'a> {
    pub peer_chain: &'a [Vec<u8>],
    pub negotiated_kx: &'a str,
}

/// The DH group policy returned by `ephemeral_dh_params`: prime size and
/// subgroup order size in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhGroup {
    pub prime_bits: u32,
    pub subgroup_bits: u32,
}

/// Default policy: `<=1024->1024/160`, `<=2048->2048/224`, else
/// `2048/256`.
pub fn default_dh_group(requested_bits: u32) -> DhGroup {
    if requested_bits <= 1024 {
        DhGroup {
            prime_bits: 1024,
            subgroup_bits: 160,
        }
    } else if requested_bits <= 2048 {
        DhGroup {
            prime_bits: 2048,
            subgroup_bits: 224,
        }
    } else {
        DhGroup {
            prime_bits: 2048,
            subgroup_bits: 256,
        }
    }
}

/// An upcall failed. Carries no payload beyond a message: the engine
/// observes `Err` as "upcall failed; abort current primitive step",
/// never lets the exception itself cross the boundary.
#[derive(Debug, Clone)]
pub struct UpcallError(pub Arc<str>);

impl UpcallError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self(message.into())
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(format!("{what}: not supported by this caller"))
    }
}

impl From<UpcallError> for Error {
    fn from(e: UpcallError) -> Self {
        Error::handshake(e.0)
    }
}

/// Caller-supplied callback bundle. Every installed
/// [`HandshakeUpcallEnvironment`] carries one of these; the router calls
/// straight through, bracketing each call with the `AppData` mutex.
///
/// `psk_*` and `ephemeral_dh_params` have default bodies because `rustls`
/// (this crate's primitive-library collaborator) does not negotiate raw
/// PSK suites or DHE key exchange. They remain independently callable
/// and tested; callers that need them provide their own override.
pub trait CallbackSet: Send + Sync {
    fn verify_certificate_chain(&self, session: &TransientSession<'_>) -> Result<(), UpcallError>;

    fn client_certificate_requested(
        &self,
        acceptable_key_types: &[u8],
        issuer_names: &[Vec<u8>],
    ) -> Result<ClientCertChoice, UpcallError>;

    fn psk_client_key_requested(
        &self,
        _identity_hint: Option<&str>,
        _identity_buf: &mut [u8],
        _key_buf: &mut [u8],
    ) -> Result<usize, UpcallError> {
        Err(UpcallError::unsupported("psk_client_key_requested"))
    }

    fn psk_server_key_requested(
        &self,
        _identity_hint: Option<&str>,
        _identity: &[u8],
        _key_buf: &mut [u8],
    ) -> Result<usize, UpcallError> {
        Err(UpcallError::unsupported("psk_server_key_requested"))
    }

    fn info_state_change(&self, _where_mask: InfoWhere, _result: i32) {}

    /// Standard "first protocol in server list that also appears in
    /// client list" algorithm. `None` means no overlap: the caller
    /// continues without ALPN rather than failing (NOACK).
    fn alpn_select(&self, server_protocols: &[Vec<u8>], client_protocols: &[Vec<u8>]) -> Option<Vec<u8>> {
        server_protocols
            .iter()
            .find(|p| client_protocols.contains(p))
            .cloned()
    }

    fn ephemeral_dh_params(&self, requested_key_bits: u32) -> DhGroup {
        default_dh_group(requested_key_bits)
    }
}

/// Transient, scoped to a single re-entrant call into `rustls`.
/// Installed immediately before a call that may upcall, cleared
/// immediately after.
pub struct HandshakeUpcallEnvironment {
    pub callbacks: Arc<dyn CallbackSet>,
    fd_handle: Option<RawFd>,
}

impl HandshakeUpcallEnvironment {
    pub fn new(callbacks: Arc<dyn CallbackSet>, fd_handle: Option<RawFd>) -> Self {
        Self { callbacks, fd_handle }
    }

    /// Engine-mode connections have no backing fd; only socket-mode
    /// connections can observe "fd already closed" in `install_upcall`.
    pub fn fd_is_closed(&self) -> bool {
        match self.fd_handle {
            Some(fd) => fd_is_closed(fd),
            None => false,
        }
    }
}

#[cfg(unix)]
fn fd_is_closed(fd: RawFd) -> bool {
    // SAFETY: `fcntl(F_GETFD)` is a pure query; `fd` may be any integer,
    // valid or not -- that's exactly what we're testing for.
    unsafe { libc::fcntl(fd, libc::F_GETFD) == -1 }
}

/// Bracket one upcall: acquire `app`'s mutex, require an installed
/// environment, invoke `call`, translate its result, always clear the
/// environment on the way out.
pub(crate) fn dispatch<T>(
    app: &crate::appdata::AppData,
    call: impl FnOnce(&Arc<dyn CallbackSet>) -> Result<T, UpcallError>,
) -> Result<T, Error> {
    let guard = app.lock();
    let env = match app.upcall_env(&guard) {
        Some(env) => env,
        None => {
            warn!("upcall dispatched with no installed environment");
            return Err(Error::illegal_state("no upcall environment installed"));
        }
    };
    let callbacks = Arc::clone(&env.callbacks);
    drop(guard);

    let result = call(&callbacks).map_err(Error::from);
    if result.is_err() {
        trace!("upcall failed; current primitive step aborts");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Accepting;
    impl CallbackSet for Accepting {
        fn verify_certificate_chain(&self, _s: &TransientSession<'_>) -> Result<(), UpcallError> {
            Ok(())
        }
        fn client_certificate_requested(
            &self,
            _k: &[u8],
            _i: &[Vec<u8>],
        ) -> Result<ClientCertChoice, UpcallError> {
            Ok(None)
        }
    }

    #[test]
    fn default_dh_group_policy_matches_size_bands() {
        assert_eq!(default_dh_group(512), DhGroup { prime_bits: 1024, subgroup_bits: 160 });
        assert_eq!(default_dh_group(1024), DhGroup { prime_bits: 1024, subgroup_bits: 160 });
        assert_eq!(default_dh_group(1025), DhGroup { prime_bits: 2048, subgroup_bits: 224 });
        assert_eq!(default_dh_group(2048), DhGroup { prime_bits: 2048, subgroup_bits: 224 });
        assert_eq!(default_dh_group(3072), DhGroup { prime_bits: 2048, subgroup_bits: 256 });
    }

    #[test]
    fn alpn_select_picks_first_server_protocol_present_on_client() {
        let cb = Accepting;
        let server = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let client = vec![b"http/1.1".to_vec()];
        assert_eq!(cb.alpn_select(&server, &client), Some(b"http/1.1".to_vec()));
    }

    #[test]
    fn alpn_select_returns_none_on_no_overlap() {
        let cb = Accepting;
        let server = vec![b"h2".to_vec()];
        let client = vec![b"spdy/3".to_vec()];
        assert_eq!(cb.alpn_select(&server, &client), None);
    }

    #[test]
    fn dispatch_without_installed_environment_is_illegal_state() {
        let app = crate::appdata::AppData::new().unwrap();
        let result: Result<(), Error> = dispatch(&app, |_cb| Ok(()));
        assert_eq!(result.unwrap_err().kind, ErrorKind::IllegalState);
    }

    #[test]
    fn dispatch_runs_installed_callback() {
        let app = crate::appdata::AppData::new().unwrap();
        {
            let mut guard = app.lock();
            app.install_upcall(&mut guard, HandshakeUpcallEnvironment::new(Arc::new(Accepting), None))
                .unwrap();
        }
        let result = dispatch(&app, |cb| {
            cb.client_certificate_requested(&[], &[])
        });
        assert!(matches!(result, Ok(None)));
    }
}
