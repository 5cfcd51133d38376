//! Connection state machine and engine I/O surface.
//!
//! A [`Connection`] wraps one `rustls::Connection` (the underlying
//! protocol engine this crate builds its glue around) together with the
//! state diagram, BIO, AppData, and upcall wiring described in this
//! module. Two transports share the same core: an owned/borrowed socket
//! driven by `sslSelect`, or caller-supplied byte buffers driven
//! directly, with no blocking at all ("engine mode").

use std::io::{Cursor, Read as _, Write as _};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bio::{Bio, BioResult, IoAdapter};
use crate::config::{ConnectionConfig, VerifyMode};
use crate::error::{Error, ErrorKind};
use crate::log::warn;
use crate::session::Session;
use crate::upcall::{CallbackSet, HandshakeUpcallEnvironment, TransientSession};

/// Client vs server mode: exactly one, immutable once set via
/// `set_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// The connection lifecycle, from construction through handshake,
/// steady-state, to shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    ModeSet,
    HandshakeWanted,
    HandshakeStarted,
    HandshakeCompleted,
    /// False Start: application data may already flow, but the
    /// handshake-completed event has not yet arrived.
    ReadyHandshakeCutThrough,
    Ready,
    ClosedInbound,
    ClosedOutbound,
    Closed,
}

/// Outcome of driving the handshake loop one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    WantRead,
    WantWrite,
    Done,
}

/// `status` half of an engine-mode `wrap`/`unwrap` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    Closed,
    BufferOverflow,
    BufferUnderflow,
}

/// `handshake_status` half of an engine-mode result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    NotHandshaking,
    Finished,
}

/// Result of one `wrap`/`unwrap` call.
#[derive(Debug, Clone, Copy)]
pub struct EngineIoResult {
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
}

/// The transport half of a [`Connection`]: either a real, `sslSelect`-able
/// fd-backed BIO, or nothing at all (engine mode drives `rustls` directly
/// over caller-supplied slices).
enum Transport {
    Socket(Box<dyn Bio>),
    Engine,
}

/// Bridges `rustls`'s certificate verification into the upcall router:
/// delegates real PKI validation to the configured trust manager (or a
/// permissive default when `verify_mode` is `None`), then gives caller
/// code one more veto by dispatching `verify_certificate_chain` through
/// whatever environment is installed on `appdata` -- with the transient
/// peer chain visible for exactly the duration of the call.
struct BridgingVerifier {
    appdata: Arc<crate::appdata::AppData>,
    inner: Option<Arc<dyn rustls::client::ServerCertVerifier>>,
    verify_mode: VerifyMode,
    handshake_peer_chain: Arc<Mutex<Option<Vec<Vec<u8>>>>>,
}

impl std::fmt::Debug for BridgingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgingVerifier").finish()
    }
}

impl rustls::client::ServerCertVerifier for BridgingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        intermediates: &[rustls::Certificate],
        server_name: &rustls::ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        if self.verify_mode == VerifyMode::None {
            return Ok(rustls::client::ServerCertVerified::assertion());
        }

        if let Some(inner) = &self.inner {
            inner.verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now)?;
        }

        let mut chain = vec![end_entity.0.clone()];
        chain.extend(intermediates.iter().map(|c| c.0.clone()));
        *self.handshake_peer_chain.lock().unwrap_or_else(|p| p.into_inner()) = Some(chain.clone());

        let result = crate::upcall::dispatch(&self.appdata, |cb| {
            cb.verify_certificate_chain(&TransientSession {
                peer_chain: &chain,
                // rustls's `ServerCertVerifier` hook does not carry the
                // negotiated key-exchange name; unlike BoringSSL's
                // verify callback, that information isn't available
                // until later in the handshake.
                negotiated_kx: "",
            })
        });

        *self.handshake_peer_chain.lock().unwrap_or_else(|p| p.into_inner()) = None;

        match result {
            Ok(()) => Ok(rustls::client::ServerCertVerified::assertion()),
            Err(e) => Err(rustls::Error::General(e.to_string())),
        }
    }
}

/// The handshake/steady-state/shutdown orchestrator.
pub struct Connection {
    mode: Mode,
    state: ConnState,
    inner: rustls::Connection,
    config: Arc<ConnectionConfig>,
    appdata: Arc<crate::appdata::AppData>,
    transport: Transport,
    selected_alpn: Option<Vec<u8>>,
    error: Option<Error>,
    false_start_enabled: bool,
    false_start_armed: bool,
    handshake_peer_chain: Arc<Mutex<Option<Vec<Vec<u8>>>>>,
    close_notify_sent: bool,
    close_notify_received: bool,
}

impl Connection {
    fn new(
        mode: Mode,
        inner: rustls::Connection,
        config: Arc<ConnectionConfig>,
        transport: Transport,
        false_start_enabled: bool,
    ) -> Result<Self, Error> {
        let appdata = Arc::new(crate::appdata::AppData::new().map_err(|e| {
            Error::new(ErrorKind::Io, format!("failed to create AppData: {e:?}"))
        })?);
        Ok(Self {
            mode,
            state: ConnState::ModeSet,
            inner,
            config,
            appdata,
            transport,
            selected_alpn: None,
            error: None,
            false_start_enabled,
            false_start_armed: false,
            handshake_peer_chain: Arc::new(Mutex::new(None)),
            close_notify_sent: false,
            close_notify_received: false,
        })
    }

    /// Builds the bridging verifier for a client connection's config, to
    /// be installed into the `rustls::ClientConfig` this connection will
    /// drive. Exposed so `Connection::client` can wire it in before the
    /// `rustls::ClientConfig` is finalized -- the per-process-cacheable
    /// parts (root store, cipher suites) are cloned cheaply into each
    /// per-connection config so the verifier can close over *this*
    /// connection's own `AppData`: the installed upcall environment is
    /// always per-connection, never shared.
    fn make_verifier(
        appdata: &Arc<crate::appdata::AppData>,
        config: &Arc<ConnectionConfig>,
        handshake_peer_chain: &Arc<Mutex<Option<Vec<Vec<u8>>>>>,
    ) -> Arc<dyn rustls::client::ServerCertVerifier> {
        Arc::new(BridgingVerifier {
            appdata: Arc::clone(appdata),
            inner: config.trust_manager().cloned(),
            verify_mode: config.verify_mode(),
            handshake_peer_chain: Arc::clone(handshake_peer_chain),
        })
    }

    /// Builds the `rustls::client::ClientConfig` a client connection will
    /// drive, translating `config.enabled_cipher_suites()`/
    /// `enabled_protocols()` into the concrete suites/versions `rustls`
    /// negotiates with. The root store passed to `with_root_certificates`
    /// is never consulted once `dangerous().set_certificate_verifier` is
    /// installed by the caller right after this returns, so an empty store
    /// is always correct here.
    fn build_client_config(config: &Arc<ConnectionConfig>) -> Result<rustls::client::ClientConfig, Error> {
        let suites = resolve_cipher_suites(config.enabled_cipher_suites());
        let versions = resolve_protocol_versions(config.enabled_protocols());
        let builder = rustls::client::ClientConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(&versions)
            .map_err(|e| {
                Error::new(
                    ErrorKind::SslProtocol,
                    format!("enabled cipher suites/protocols negotiate nothing usable: {e}"),
                )
            })?;
        Ok(builder
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth())
    }

    /// Builds the `rustls::server::ServerConfig` a server connection will
    /// drive, the server-side counterpart of `build_client_config`.
    /// Client-certificate enforcement (`need_client_auth`/
    /// `want_client_auth`) is recorded as an Open Question in DESIGN.md
    /// rather than wired here: there is no client-CA trust store in
    /// `ConnectionConfig` to build a `ClientCertVerifier` from, only the
    /// advisory `client_ca_names` DN list sent in `CertificateRequest`.
    fn build_server_config(config: &Arc<ConnectionConfig>) -> Result<Arc<rustls::server::ServerConfig>, Error> {
        let key_manager = config
            .key_manager()
            .ok_or_else(|| Error::illegal_state("server connection requires a key_manager"))?
            .clone();
        let suites = resolve_cipher_suites(config.enabled_cipher_suites());
        let versions = resolve_protocol_versions(config.enabled_protocols());
        let builder = rustls::server::ServerConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(&versions)
            .map_err(|e| {
                Error::new(
                    ErrorKind::SslProtocol,
                    format!("enabled cipher suites/protocols negotiate nothing usable: {e}"),
                )
            })?;
        Ok(Arc::new(builder.with_no_client_auth().with_cert_resolver(key_manager)))
    }

    /// Builds a client connection over a socket transport. In socket
    /// mode the call goes straight to `HANDSHAKE_STARTED`.
    pub fn client_socket(
        server_name: rustls::ServerName,
        config: Arc<ConnectionConfig>,
        fd: RawFd,
        owns_fd: bool,
        false_start_enabled: bool,
    ) -> Result<Self, Error> {
        let bio: Box<dyn Bio> = if owns_fd {
            Box::new(crate::bio::socket::SocketBio::owned(fd))
        } else {
            Box::new(crate::bio::socket::SocketBio::borrowed(fd))
        };
        let appdata = Arc::new(crate::appdata::AppData::new().map_err(|e| {
            Error::new(ErrorKind::Io, format!("failed to create AppData: {e:?}"))
        })?);
        let handshake_peer_chain = Arc::new(Mutex::new(None));
        let verifier = Self::make_verifier(&appdata, &config, &handshake_peer_chain);
        let mut tls_config = Self::build_client_config(&config)?;
        tls_config.dangerous().set_certificate_verifier(verifier);
        let client_config = Arc::new(tls_config);
        let inner = rustls::Connection::Client(
            rustls::ClientConnection::new(client_config, server_name)
                .map_err(crate::error::from_rustls)?,
        );
        Ok(Self {
            mode: Mode::Client,
            state: ConnState::HandshakeStarted,
            inner,
            config,
            appdata,
            transport: Transport::Socket(bio),
            selected_alpn: None,
            error: None,
            false_start_enabled,
            false_start_armed: false,
            handshake_peer_chain,
            close_notify_sent: false,
            close_notify_received: false,
        })
    }

    /// Builds a client connection over engine-mode (caller-supplied
    /// buffers), starting in `HANDSHAKE_WANTED`: engine mode needs an
    /// explicit `begin_handshake`.
    pub fn client_engine(
        server_name: rustls::ServerName,
        config: Arc<ConnectionConfig>,
        false_start_enabled: bool,
    ) -> Result<Self, Error> {
        let appdata = Arc::new(crate::appdata::AppData::new().map_err(|e| {
            Error::new(ErrorKind::Io, format!("failed to create AppData: {e:?}"))
        })?);
        let handshake_peer_chain = Arc::new(Mutex::new(None));
        let verifier = Self::make_verifier(&appdata, &config, &handshake_peer_chain);
        let mut tls_config = Self::build_client_config(&config)?;
        tls_config.dangerous().set_certificate_verifier(verifier);
        let client_config = Arc::new(tls_config);
        let inner = rustls::Connection::Client(
            rustls::ClientConnection::new(client_config, server_name)
                .map_err(crate::error::from_rustls)?,
        );
        Ok(Self {
            mode: Mode::Client,
            state: ConnState::HandshakeWanted,
            inner,
            config,
            appdata,
            transport: Transport::Engine,
            selected_alpn: None,
            error: None,
            false_start_enabled,
            false_start_armed: false,
            handshake_peer_chain,
            close_notify_sent: false,
            close_notify_received: false,
        })
    }

    /// Builds a server connection over a socket transport.
    pub fn server_socket(config: Arc<ConnectionConfig>, fd: RawFd, owns_fd: bool) -> Result<Self, Error> {
        let bio: Box<dyn Bio> = if owns_fd {
            Box::new(crate::bio::socket::SocketBio::owned(fd))
        } else {
            Box::new(crate::bio::socket::SocketBio::borrowed(fd))
        };
        let tls_config = Self::build_server_config(&config)?;
        let inner = rustls::Connection::Server(
            rustls::ServerConnection::new(tls_config).map_err(crate::error::from_rustls)?,
        );
        let mut conn = Self::new(Mode::Server, inner, config, Transport::Socket(bio), false)?;
        conn.state = ConnState::HandshakeStarted;
        Ok(conn)
    }

    /// Builds a server connection in engine mode.
    pub fn server_engine(config: Arc<ConnectionConfig>) -> Result<Self, Error> {
        let tls_config = Self::build_server_config(&config)?;
        let inner = rustls::Connection::Server(
            rustls::ServerConnection::new(tls_config).map_err(crate::error::from_rustls)?,
        );
        Self::new(Mode::Server, inner, config, Transport::Engine, false)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Only observable once negotiated.
    pub fn selected_alpn(&self) -> Option<&[u8]> {
        match self.state {
            ConnState::HandshakeCompleted | ConnState::Ready | ConnState::ReadyHandshakeCutThrough => {
                self.selected_alpn.as_deref()
            }
            _ => None,
        }
    }

    /// Installs the caller's upcall environment for the duration of
    /// whatever primitive-library calls follow.
    pub fn install_upcall(&self, callbacks: Arc<dyn CallbackSet>, fd_handle: Option<RawFd>) -> Result<(), Error> {
        let mut guard = self.appdata.lock();
        self.appdata
            .install_upcall(&mut guard, HandshakeUpcallEnvironment::new(callbacks, fd_handle))
            .map_err(|_| Error::illegal_state("upcall fd already closed"))
    }

    pub fn clear_upcall(&self) {
        let mut guard = self.appdata.lock();
        self.appdata.clear_upcall(&mut guard);
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!("connection failing: {err}");
        self.state = ConnState::Closed;
        let raised = self.config.raise(err);
        self.error = Some(raised.clone());
        raised
    }

    fn classify_handshake_status(&self) -> HandshakeStatus {
        if !self.inner.is_handshaking() {
            HandshakeStatus::NotHandshaking
        } else if self.inner.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.inner.wants_read() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NeedTask
        }
    }

    // ---- Socket mode ---------------------------------------------------

    /// One iteration of the handshake loop.
    /// Socket mode callers drive this from `read`/`write`/an explicit
    /// `do_handshake`; repeat on `WantRead`/`WantWrite` after a
    /// `sslSelect`.
    pub fn drive_handshake_step(&mut self) -> Result<HandshakeStep, Error> {
        let bio = match &mut self.transport {
            Transport::Socket(bio) => bio,
            Transport::Engine => {
                return Err(Error::illegal_state("drive_handshake_step is socket-mode only"))
            }
        };

        if self.inner.wants_write() {
            let mut adapter = IoAdapter::new(bio.as_mut());
            match self.inner.write_tls(&mut adapter) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStep::WantWrite)
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        if self.inner.wants_read() {
            let mut adapter = IoAdapter::new(bio.as_mut());
            let n = match self.inner.read_tls(&mut adapter) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStep::WantRead)
                }
                Err(e) => return Err(Error::from(e)),
            };
            if n == 0 {
                // Clean remote close during handshake.
                return Err(Error::handshake("connection closed by peer during handshake"));
            }
            self.inner
                .process_new_packets()
                .map_err(crate::error::from_rustls)?;
        }

        if !self.inner.is_handshaking() {
            Ok(HandshakeStep::Done)
        } else if self.inner.wants_write() {
            Ok(HandshakeStep::WantWrite)
        } else {
            Ok(HandshakeStep::WantRead)
        }
    }

    /// Drives the handshake to completion over a socket transport,
    /// blocking on `sslSelect` between `WANT_READ`/`WANT_WRITE` steps
    /// until `deadline`.
    pub fn do_handshake(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        if !self.appdata.begin_wait() {
            return Err(Error::illegal_state("too many threads already waiting on this connection"));
        }
        let result = self.do_handshake_inner(deadline);
        self.appdata.end_wait();
        result
    }

    fn do_handshake_inner(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        loop {
            if !self.appdata.is_alive() {
                return Err(Error::io("socket closed"));
            }
            match self.drive_handshake_step() {
                Ok(HandshakeStep::Done) => {
                    self.refresh_state_after_io();
                    return Ok(());
                }
                Ok(HandshakeStep::WantRead) => self.ssl_select(true, false, deadline)?,
                Ok(HandshakeStep::WantWrite) => self.ssl_select(false, true, deadline)?,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn refresh_selected_alpn(&mut self) {
        self.selected_alpn = self.inner.alpn_protocol().map(|p| p.to_vec());
    }

    /// `sslSelect`: the sole suspension point. Polls the
    /// transport fd and the `AppData` wakeup pipe; `EINTR` is
    /// transparent; a timed-out deadline raises `Timeout`; the wakeup
    /// pipe firing (via `interrupt()`) raises `Io`.
    fn ssl_select(&mut self, want_read: bool, want_write: bool, deadline: Option<Instant>) -> Result<(), Error> {
        let fd = match &self.transport {
            Transport::Socket(bio) => bio
                .raw_fd()
                .ok_or_else(|| Error::illegal_state("socket transport has no fd"))?,
            Transport::Engine => return Err(Error::illegal_state("ssl_select is socket-mode only")),
        };
        let wakeup_fd = self.appdata.wakeup_read_fd();

        loop {
            if !self.appdata.is_alive() {
                return Err(Error::io("socket closed"));
            }
            let timeout_ms = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::new(ErrorKind::Timeout, "sslSelect deadline exceeded"));
                    }
                    (d - now).as_millis().min(i32::MAX as u128) as i32
                }
                None => -1,
            };

            let mut fds = [
                libc::pollfd {
                    fd,
                    events: (if want_read { libc::POLLIN } else { 0 }) | (if want_write { libc::POLLOUT } else { 0 }),
                    revents: 0,
                },
                libc::pollfd {
                    fd: wakeup_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            // SAFETY: `fds` is a valid, correctly-sized array for the
            // duration of this call.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::from(err));
            }
            if rc == 0 {
                return Err(Error::new(ErrorKind::Timeout, "sslSelect timed out"));
            }
            if fds[1].revents != 0 {
                self.appdata.drain_wakeup();
                if !self.appdata.is_alive() {
                    return Err(Error::io("socket closed"));
                }
                // Spuriously woken (e.g. another thread's I/O moved
                // bytes); fall through and retry the poll.
            }
            if fds[0].revents != 0 {
                return Ok(());
            }
        }
    }

    /// `read(buf, offset, len, timeout_ms)`: socket mode only.
    pub fn read(&mut self, buf: &mut [u8], offset: usize, len: usize, timeout_ms: Option<u64>) -> Result<isize, Error> {
        validate_bounds(buf.len(), offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        self.require_ready_for_io()?;

        if !self.appdata.begin_wait() {
            return Err(Error::illegal_state("too many threads already waiting on this connection"));
        }
        let result = self.read_inner(&mut buf[offset..offset + len], timeout_ms);
        self.appdata.end_wait();
        result
    }

    fn read_inner(&mut self, dst: &mut [u8], timeout_ms: Option<u64>) -> Result<isize, Error> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            if !self.appdata.is_alive() {
                return Err(Error::io("socket closed"));
            }
            let moved_before = self.bytes_moved();

            {
                // `Reader::read` returns `Ok(0)` only on a clean peer
                // close; absent data it reports `WouldBlock` instead, so
                // an `Ok(0)` here is unambiguous.
                match self.inner.reader().read(dst) {
                    Ok(0) => return Ok(-1),
                    Ok(n) => {
                        self.wake_other_thread_if_moved(moved_before);
                        return Ok(n as isize);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.fail(Error::from(e))),
                }
            }

            match self.drive_handshake_step() {
                Ok(HandshakeStep::Done) => {
                    self.refresh_state_after_io();
                    continue;
                }
                Ok(HandshakeStep::WantRead) => self.ssl_select(true, false, deadline)?,
                Ok(HandshakeStep::WantWrite) => self.ssl_select(false, true, deadline)?,
                Err(e) => return Err(self.fail(e)),
            }
            self.wake_other_thread_if_moved(moved_before);
        }
    }

    /// `write(buf, offset, len, timeout_ms)`: socket mode only.
    pub fn write(&mut self, buf: &[u8], offset: usize, len: usize, timeout_ms: Option<u64>) -> Result<usize, Error> {
        validate_bounds(buf.len(), offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        self.require_ready_for_io()?;

        if !self.appdata.begin_wait() {
            return Err(Error::illegal_state("too many threads already waiting on this connection"));
        }
        let result = self.write_inner(&buf[offset..offset + len], timeout_ms);
        self.appdata.end_wait();
        result
    }

    fn write_inner(&mut self, src: &[u8], timeout_ms: Option<u64>) -> Result<usize, Error> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        // A False-Start-enabled client may enter here mid-handshake (see
        // `require_ready_for_io`): drive the handshake forward until
        // either it completes or the cut-through window opens, rather
        // than writing into a connection that can't encrypt yet.
        while !self.can_write_application_data() {
            if !self.appdata.is_alive() {
                return Err(Error::io("socket closed"));
            }
            match self.drive_handshake_step() {
                Ok(HandshakeStep::WantRead) => self.ssl_select(true, false, deadline)?,
                Ok(HandshakeStep::WantWrite) => self.ssl_select(false, true, deadline)?,
                Ok(HandshakeStep::Done) => {}
                Err(e) => return Err(self.fail(e)),
            }
            self.refresh_state_after_io();
        }

        let mut written = 0;
        while written < src.len() {
            if !self.appdata.is_alive() {
                return Err(Error::io("socket closed"));
            }
            let moved_before = self.bytes_moved();

            let n = self
                .inner
                .writer()
                .write(&src[written..])
                .map_err(Error::from)?;
            written += n;

            match self.flush_to_transport(deadline) {
                Ok(()) => {}
                Err(e) => return Err(self.fail(e)),
            }
            self.wake_other_thread_if_moved(moved_before);

            if n == 0 && written < src.len() {
                match self.drive_handshake_step() {
                    Ok(HandshakeStep::WantRead) => self.ssl_select(true, false, deadline)?,
                    Ok(HandshakeStep::WantWrite) => self.ssl_select(false, true, deadline)?,
                    Ok(HandshakeStep::Done) => {}
                    Err(e) => return Err(self.fail(e)),
                }
                self.refresh_state_after_io();
            }
        }
        Ok(written)
    }

    fn flush_to_transport(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        let bio = match &mut self.transport {
            Transport::Socket(bio) => bio,
            Transport::Engine => return Ok(()),
        };
        while self.inner.wants_write() {
            let mut adapter = IoAdapter::new(bio.as_mut());
            match self.inner.write_tls(&mut adapter) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.ssl_select(false, true, deadline)?;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    fn bytes_moved(&self) -> u64 {
        match &self.transport {
            Transport::Socket(bio) => bio.total_read() + bio.total_written(),
            Transport::Engine => 0,
        }
    }

    fn wake_other_thread_if_moved(&self, moved_before: u64) {
        if self.bytes_moved() != moved_before && self.appdata.waiting_threads() > 1 {
            self.appdata.notify();
        }
    }

    fn require_ready_for_io(&self) -> Result<(), Error> {
        match self.state {
            ConnState::Ready | ConnState::ReadyHandshakeCutThrough => Ok(()),
            ConnState::Closed | ConnState::ClosedInbound | ConnState::ClosedOutbound => {
                Err(Error::illegal_state("connection is closed"))
            }
            // A False-Start-enabled client is allowed to call read/write
            // while still mid-handshake; `write_inner`/`read_inner` drive
            // the handshake the rest of the way themselves and gate the
            // actual application-data transfer on `can_write_application_data`.
            ConnState::HandshakeStarted if self.false_start_enabled && self.mode == Mode::Client => Ok(()),
            _ => Err(Error::illegal_state(
                "handshake not finished, False Start not enabled, and no renegotiation pending",
            )),
        }
    }

    /// `shutdown()`: sends close_notify. Socket mode only; engine mode
    /// close runs through `wrap`/`unwrap` observing `EngineStatus::Closed`.
    pub fn shutdown(&mut self) -> Result<bool, Error> {
        match &mut self.transport {
            Transport::Socket(bio) => {
                if !self.close_notify_sent {
                    self.inner.send_close_notify();
                    let mut adapter = IoAdapter::new(bio.as_mut());
                    while self.inner.wants_write() {
                        match self.inner.write_tls(&mut adapter) {
                            Ok(_) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(Error::from(e)),
                        }
                    }
                    self.close_notify_sent = true;
                    self.state = ConnState::ClosedOutbound;
                }
                if self.close_notify_received {
                    self.state = ConnState::Closed;
                    return Ok(true);
                }
                Ok(false)
            }
            Transport::Engine => Err(Error::illegal_state("shutdown() is socket-mode only; use wrap/unwrap")),
        }
    }

    /// `interrupt()`: monotonic cancellation, wakes up to two blocked
    /// threads.
    pub fn interrupt(&self) {
        self.appdata.interrupt();
    }

    /// `renegotiate()`. `rustls` deliberately does not implement TLS
    /// renegotiation (RFC 5746 made it a perennial source of downgrade
    /// attacks), so this always reports `SslProtocol` rather than
    /// silently succeeding.
    pub fn renegotiate(&mut self) -> Result<(), Error> {
        Err(Error::new(
            ErrorKind::SslProtocol,
            "renegotiation is not supported by the underlying TLS engine",
        ))
    }

    /// Builds a [`Session`] snapshot from the connection's current
    /// negotiated state; `None` before/without a completed handshake.
    pub fn session(&self) -> Option<Session> {
        if self.inner.is_handshaking() {
            return None;
        }
        let cipher = self.inner.negotiated_cipher_suite()?;
        let protocol = self.inner.protocol_version()?;
        let peer_chain: Vec<Vec<u8>> = self
            .inner
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.0.clone()).collect())
            .unwrap_or_default();
        Some(Session::new(
            cipher_suite_name(cipher),
            protocol_version_name(protocol),
            &peer_chain,
            self.config.sni_hostname(),
        ))
    }

    // ---- Engine mode ----------------------------------------------------

    /// Queues an outbound `close_notify` for engine mode: the next
    /// `wrap()` call flushes it into `dst` and reports
    /// `EngineStatus::Closed`. The socket-mode equivalent is `shutdown()`;
    /// engine mode has no fd to drive directly, so closing is just
    /// another `wrap`/`unwrap` round trip over the caller's own buffers.
    pub fn close_outbound(&mut self) -> Result<(), Error> {
        self.require_engine_mode()?;
        if !self.close_notify_sent {
            self.inner.send_close_notify();
            self.close_notify_sent = true;
        }
        Ok(())
    }

    /// `wrap(src, dst)`: consumes application bytes from `src` (queuing
    /// them for encryption, subject to False Start / handshake gating)
    /// and produces ciphertext into `dst`.
    pub fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineIoResult, Error> {
        self.require_engine_mode()?;

        if self.state == ConnState::HandshakeWanted {
            self.state = ConnState::HandshakeStarted;
        }

        let mut consumed = 0;
        if !src.is_empty() && self.can_write_application_data() {
            consumed = self.inner.writer().write(src).map_err(Error::from)?;
        }

        let mut writer = Cursor::new(dst);
        let before = writer.position() as usize;
        let write_result = self.inner.write_tls(&mut writer);
        let produced = writer.position() as usize - before;

        let status = match write_result {
            Ok(_) if self.inner.wants_write() && produced == (writer.get_ref().len()) => {
                EngineStatus::BufferOverflow
            }
            Ok(_) => EngineStatus::Ok,
            Err(e) => return Err(Error::from(e)),
        };

        self.refresh_state_after_io();
        Ok(EngineIoResult {
            bytes_consumed: consumed,
            bytes_produced: produced,
            status: if self.close_notify_sent && status == EngineStatus::Ok {
                EngineStatus::Closed
            } else {
                status
            },
            handshake_status: self.classify_handshake_status(),
        })
    }

    /// `unwrap(src, dst)`: hands ciphertext in `src` to the engine and
    /// copies any resulting plaintext into `dst`.
    pub fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineIoResult, Error> {
        self.require_engine_mode()?;

        if self.state == ConnState::HandshakeWanted {
            self.state = ConnState::HandshakeStarted;
        }

        let mut reader = Cursor::new(src);
        let read_result = self.inner.read_tls(&mut reader);
        let consumed = reader.position() as usize;

        let n = match read_result {
            Ok(n) => n,
            Err(e) => return Err(Error::from(e)),
        };
        if n == 0 && !src.is_empty() {
            return Ok(EngineIoResult {
                bytes_consumed: consumed,
                bytes_produced: 0,
                status: EngineStatus::BufferUnderflow,
                handshake_status: self.classify_handshake_status(),
            });
        }

        let io_state = self
            .inner
            .process_new_packets()
            .map_err(|e| self.fail(crate::error::from_rustls(e)))?;
        if io_state.peer_has_closed() {
            self.close_notify_received = true;
        }

        let mut produced = 0;
        if io_state.plaintext_bytes_to_read() > 0 {
            match self.inner.reader().read(dst) {
                Ok(n) => produced = n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::from(e)),
            }
        }

        self.refresh_state_after_io();

        let status = if self.close_notify_received {
            EngineStatus::Closed
        } else if io_state.plaintext_bytes_to_read() > produced && produced == dst.len() {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineIoResult {
            bytes_consumed: consumed,
            bytes_produced: produced,
            status,
            handshake_status: self.classify_handshake_status(),
        })
    }

    /// True exactly in the False Start window: a client has sent
    /// everything it needs to for the handshake (including its own
    /// `Finished`) but is still waiting to verify the peer's `Finished`.
    /// `rustls` does not expose a dedicated "cut-through" flag, so this
    /// is reconstructed from three things that are each true only once
    /// the key exchange is over: a cipher suite has been negotiated
    /// (ruling out the pre-`ServerHello` idle point, where `wants_write`
    /// is also momentarily false right after `ClientHello` goes out),
    /// nothing is left to write, and a read is still wanted.
    fn false_start_ready(&self) -> bool {
        self.mode == Mode::Client
            && self.false_start_enabled
            && self.inner.is_handshaking()
            && self.inner.negotiated_cipher_suite().is_some()
            && !self.inner.wants_write()
            && self.inner.wants_read()
    }

    fn can_write_application_data(&self) -> bool {
        matches!(self.state, ConnState::Ready | ConnState::ReadyHandshakeCutThrough) || self.false_start_ready()
    }

    /// Recomputes `state` (and, once negotiated, `selected_alpn`) after a
    /// primitive-library step, in both socket mode (`do_handshake`/`read`/
    /// `write`) and engine mode (`wrap`/`unwrap`). Promotes
    /// `HandshakeStarted`/`HandshakeWanted` to `ReadyHandshakeCutThrough`
    /// the moment `false_start_ready` holds, and to `Ready` once the
    /// handshake is fully done.
    fn refresh_state_after_io(&mut self) {
        if !self.inner.is_handshaking() {
            self.refresh_selected_alpn();
            if matches!(
                self.state,
                ConnState::HandshakeStarted | ConnState::HandshakeWanted | ConnState::ReadyHandshakeCutThrough
            ) {
                self.state = ConnState::Ready;
            }
        } else if self.false_start_ready()
            && matches!(self.state, ConnState::HandshakeStarted | ConnState::HandshakeWanted)
        {
            self.state = ConnState::ReadyHandshakeCutThrough;
            self.false_start_armed = true;
        }

        if self.close_notify_sent && self.close_notify_received {
            self.state = ConnState::Closed;
        } else if self.close_notify_received {
            self.state = ConnState::ClosedInbound;
        } else if self.close_notify_sent {
            self.state = ConnState::ClosedOutbound;
        }
    }

    fn require_engine_mode(&self) -> Result<(), Error> {
        match self.transport {
            Transport::Engine => Ok(()),
            Transport::Socket(_) => Err(Error::illegal_state("wrap/unwrap are engine-mode only")),
        }
    }
}

/// Validates `(array, offset, length)`: offsets/lengths outside
/// `[0, array.len - offset]` fail `ArrayBounds`; length 0 is always
/// legal.
fn validate_bounds(array_len: usize, offset: usize, length: usize) -> Result<(), Error> {
    if offset > array_len {
        return Err(Error::array_bounds());
    }
    if length > array_len - offset {
        return Err(Error::array_bounds());
    }
    Ok(())
}

fn cipher_suite_name(suite: rustls::SupportedCipherSuite) -> &'static str {
    suite.suite().as_str().unwrap_or("UNKNOWN")
}

fn protocol_version_name(version: rustls::ProtocolVersion) -> &'static str {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
        _ => "UNKNOWN",
    }
}

/// Resolves IANA `TLS_*` suite names (as configured through
/// `ConnectionConfig::enabled_cipher_suites`) against the suites `rustls`
/// actually implements. `!`-prefixed entries (the always-prepended
/// `!SSLv2` sentinel included) name nothing to negotiate and are dropped;
/// an enabled list with no match against `rustls::ALL_CIPHER_SUITES`
/// resolves to an empty slice rather than an error -- `build_client_config`/
/// `build_server_config` let `rustls` itself reject that combination.
fn resolve_cipher_suites(names: &[String]) -> Vec<rustls::SupportedCipherSuite> {
    names
        .iter()
        .filter(|name| !name.starts_with('!'))
        .filter_map(|name| {
            rustls::ALL_CIPHER_SUITES
                .iter()
                .find(|suite| suite.suite().as_str().as_deref() == Some(name.as_str()))
                .copied()
        })
        .collect()
}

/// Resolves `enabled_protocols` names onto the protocol versions `rustls`
/// negotiates with `tls12` enabled (TLS 1.2/1.3 only). Names for versions
/// `rustls` never implements (SSLv3, TLS 1.0, TLS 1.1) are accepted here
/// without complaint -- they just never contribute a usable version, per
/// DESIGN.md's "TLS version surface" Open Question.
fn resolve_protocol_versions(names: &[String]) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut versions = Vec::new();
    if names.iter().any(|n| n == "TLSv1.2") {
        versions.push(&rustls::version::TLS12);
    }
    if names.iter().any(|n| n == "TLSv1.3") {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_bounds_rejects_offset_past_end() {
        let err = validate_bounds(10, 11, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArrayBounds);
    }

    #[test]
    fn validate_bounds_rejects_length_past_end() {
        let err = validate_bounds(10, 5, 6).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArrayBounds);
    }

    #[test]
    fn validate_bounds_accepts_zero_length_at_end() {
        validate_bounds(10, 10, 0).unwrap();
    }

    #[test]
    fn validate_bounds_accepts_full_range() {
        validate_bounds(10, 0, 10).unwrap();
    }

    #[test]
    fn renegotiate_reports_unsupported() {
        // Constructing a full rustls connection needs real roots/certs;
        // exercised in tests/handshake.rs. Here we just pin the
        // documented error kind via the public constant path.
        let err = Error::new(ErrorKind::SslProtocol, "renegotiation is not supported by the underlying TLS engine");
        assert_eq!(err.kind, ErrorKind::SslProtocol);
    }
}
