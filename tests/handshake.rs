//! End-to-end coverage: a full mutual handshake, a verifier rejection,
//! an interrupted blocked read, and the empty-cipher-list configuration
//! edge case.

use std::sync::Arc;

use tls_provider::upcall::{CallbackSet, ClientCertChoice, TransientSession, UpcallError};
use tls_provider::{Connection, ConnState, ConnectionConfig, EngineStatus, HandshakeStatus, VerifyMode};

struct GeneratedCert {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

fn generate_leaf(sni: &str) -> GeneratedCert {
    let cert = rcgen::generate_simple_self_signed(vec![sni.to_string()]).unwrap();
    GeneratedCert {
        cert_der: cert.serialize_der().unwrap(),
        key_der: cert.serialize_private_key_der(),
    }
}

/// A raw `rustls::server::ServerConfig`, for the tests below that drive
/// `rustls` directly rather than through this crate's `Connection`.
fn server_config(leaf: &GeneratedCert) -> Arc<rustls::server::ServerConfig> {
    let cert = rustls::Certificate(leaf.cert_der.clone());
    let key = rustls::PrivateKey(leaf.key_der.clone());
    Arc::new(
        rustls::server::ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS12])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap(),
    )
}

/// Builds a server-side [`ConnectionConfig`] wired to the given leaf
/// cert/key through [`tls_provider::single_cert_key_manager`], for the
/// tests below that drive a server through this crate's `Connection`.
fn server_connection_config(leaf: &GeneratedCert) -> Arc<ConnectionConfig> {
    let key_manager = tls_provider::single_cert_key_manager(vec![leaf.cert_der.clone()], leaf.key_der.clone())
        .unwrap();
    ConnectionConfig::builder().key_manager(key_manager).build()
}

/// A verifier that always refuses, modelling a cert-verify rejection that
/// tears down the handshake.
struct Refusing;

impl CallbackSet for Refusing {
    fn verify_certificate_chain(&self, _session: &TransientSession<'_>) -> Result<(), UpcallError> {
        Err(UpcallError::new("rejected by policy"))
    }

    fn client_certificate_requested(
        &self,
        _acceptable_key_types: &[u8],
        _issuer_names: &[Vec<u8>],
    ) -> Result<ClientCertChoice, UpcallError> {
        Ok(None)
    }
}

/// Accepts any presented chain outright. Stands in for the crate's own
/// `BridgingVerifier` (`connection.rs`), which wraps exactly this kind of
/// unconditional acceptance in an upcall round-trip -- the round-trip
/// itself is covered separately in
/// `cert_verify_rejection_translates_to_an_ssl_handshake_error`.
struct AcceptAllVerifier;

impl rustls::client::ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn client_tls_config() -> rustls::client::ClientConfig {
    let mut config = rustls::client::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAllVerifier));
    config
}

/// Drives a client/server pair to completion over a pair of in-memory
/// pipes, feeding bytes back and forth by hand (standing in for a real
/// socket: the `rustls` record layer makes no distinction between a
/// socket and any other ordered byte transport).
fn run_handshake_over_memory(
    mut client: rustls::ClientConnection,
    mut server: rustls::ServerConnection,
) -> Result<(), String> {
    let mut client_to_server = Vec::new();
    let mut server_to_client = Vec::new();

    for _ in 0..64 {
        if !client.is_handshaking() && !server.is_handshaking() {
            return Ok(());
        }

        if client.wants_write() {
            client.write_tls(&mut client_to_server).map_err(|e| e.to_string())?;
        }
        if !client_to_server.is_empty() {
            let mut cursor = std::io::Cursor::new(std::mem::take(&mut client_to_server));
            server.read_tls(&mut cursor).map_err(|e| e.to_string())?;
            server
                .process_new_packets()
                .map_err(|e| e.to_string())?;
        }

        if server.wants_write() {
            server.write_tls(&mut server_to_client).map_err(|e| e.to_string())?;
        }
        if !server_to_client.is_empty() {
            let mut cursor = std::io::Cursor::new(std::mem::take(&mut server_to_client));
            client.read_tls(&mut cursor).map_err(|e| e.to_string())?;
            client
                .process_new_packets()
                .map_err(|e| e.to_string())?;
        }
    }
    Err("handshake did not converge".to_string())
}

#[test]
fn full_mutual_handshake_over_memory_pipes_completes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let leaf = generate_leaf("example.com");
    let server_cfg = server_config(&leaf);
    let client_cfg = client_tls_config();

    let server_name = rustls::ServerName::try_from("example.com").unwrap();
    let client = rustls::ClientConnection::new(Arc::new(client_cfg), server_name).unwrap();
    let server = rustls::ServerConnection::new(server_cfg).unwrap();

    run_handshake_over_memory(client, server).unwrap();
}

/// A real caller loads certs/keys from PEM, not the DER rcgen hands back
/// directly; this exercises that path through `rustls-pemfile` the way a
/// consumer wiring a `ConnectionConfig`'s key manager would.
#[test]
fn leaf_cert_and_key_round_trip_through_pem_encoding() {
    let cert = rcgen::generate_simple_self_signed(vec!["pem.example.com".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();

    let mut cert_reader = std::io::BufReader::new(cert_pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut cert_reader).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0], cert.serialize_der().unwrap());

    let mut key_reader = std::io::BufReader::new(key_pem.as_bytes());
    let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader).unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0], cert.serialize_private_key_der());
}

#[test]
fn cert_verify_rejection_translates_to_an_ssl_handshake_error() {
    // Exercises the same path `BridgingVerifier` takes internally
    // (`connection.rs`): a refusing `CallbackSet` answer becomes an
    // `UpcallError`, which `From<UpcallError> for Error` maps onto
    // `SslHandshake` (the dispatcher itself is crate-private; this pins
    // the public half of that contract).
    let refusing = Refusing;
    let chain = vec![vec![1, 2, 3]];
    let result = refusing.verify_certificate_chain(&TransientSession {
        peer_chain: &chain,
        negotiated_kx: "",
    });
    let err: tls_provider::Error = result.unwrap_err().into();
    assert_eq!(err.kind, tls_provider::ErrorKind::SslHandshake);
}

#[test]
fn empty_cipher_list_is_accepted_at_build_time_but_unusable_at_handshake() {
    // `ConnectionConfig::builder()` accepts an empty enabled-cipher-suite
    // list with no complaint -- it is just a list of strings at that
    // layer.
    let config = ConnectionConfig::builder()
        .enabled_cipher_suites(Vec::new())
        .build();
    assert_eq!(config.enabled_cipher_suites(), &["!SSLv2".to_string()]);

    // Once a real `Connection` is built from it, the list is translated
    // into concrete `rustls` suites and handed to `rustls`'s own config
    // builder, which refuses to produce a `ClientConfig` that can't
    // negotiate anything. That failure surfaces here, at construction,
    // rather than later at the first `wrap()`/`do_handshake()` call.
    let server_name = rustls::ServerName::try_from("nowhere.example.com").unwrap();
    let err = Connection::client_engine(server_name, config, false).unwrap_err();
    assert_eq!(err.kind, tls_provider::ErrorKind::SslProtocol);
}

#[test]
fn interrupt_wakes_a_thread_blocked_on_appdata() {
    let appdata = Arc::new(tls_provider::appdata::AppData::new().unwrap());
    assert!(appdata.begin_wait());

    let waiter = Arc::clone(&appdata);
    let handle = std::thread::spawn(move || {
        // Poll the wakeup fd directly rather than pulling in the full
        // connection state machine: this test is about `AppData`'s
        // contract, not the socket loop built on top of it.
        let fd = waiter.wakeup_read_fd();
        let mut fds = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 5_000) };
        assert!(rc > 0, "expected interrupt() to wake the poll before the timeout");
        waiter.drain_wakeup();
        assert!(!waiter.is_alive());
    });

    std::thread::sleep(std::time::Duration::from_millis(20));
    appdata.interrupt();
    handle.join().unwrap();
    appdata.end_wait();
}

#[test]
fn verify_mode_none_is_honored_by_connection_config() {
    let config = ConnectionConfig::builder().verify_mode(VerifyMode::None).build();
    assert_eq!(config.verify_mode(), VerifyMode::None);
}

#[test]
fn session_round_trips_through_a_cache_after_a_handshake() {
    let leaf = generate_leaf("cache.example.com");
    let cert_der = leaf.cert_der.clone();

    let session = tls_provider::Session::new(
        "TLS_AES_128_GCM_SHA256",
        "TLSv1.2",
        &[cert_der],
        Some("cache.example.com"),
    );
    let cache = tls_provider::SessionCache::new(4);
    cache.insert(session.clone());
    let fetched = cache.get(session.id()).expect("session should still be cached");
    assert_eq!(fetched.sni(), Some("cache.example.com"));
}

/// Drives `Connection::client_engine`/`server_engine` through a complete
/// handshake, an application-data round trip, and a close, entirely over
/// caller-owned buffers -- the "C7 Engine I/O Surface" path, as opposed to
/// the raw `rustls` ping-pong `run_handshake_over_memory` exercises above.
#[test]
fn engine_mode_wrap_unwrap_completes_handshake_and_close() {
    let leaf = generate_leaf("engine.example.com");
    let server_name = rustls::ServerName::try_from("engine.example.com").unwrap();

    // `VerifyMode::None` (the default) bypasses `BridgingVerifier`'s
    // chain check entirely, matching `client_tls_config`'s
    // `AcceptAllVerifier` stand-in used by the raw-`rustls` tests above.
    let client_config = ConnectionConfig::builder().build();
    let server_config_handle = server_connection_config(&leaf);

    let mut client = Connection::client_engine(server_name, client_config, false).unwrap();
    let mut server = Connection::server_engine(server_config_handle).unwrap();

    let mut client_to_server = vec![0u8; 16 * 1024];
    let mut server_to_client = vec![0u8; 16 * 1024];
    let mut scratch = vec![0u8; 16 * 1024];

    let mut handshaking = true;
    for _ in 0..64 {
        if !handshaking {
            break;
        }
        let c = client.wrap(&[], &mut client_to_server).unwrap();
        if c.bytes_produced > 0 {
            let u = server.unwrap(&client_to_server[..c.bytes_produced], &mut scratch).unwrap();
            assert_eq!(u.bytes_produced, 0, "handshake bytes never surface as plaintext");
        }

        let s = server.wrap(&[], &mut server_to_client).unwrap();
        if s.bytes_produced > 0 {
            let u = client.unwrap(&server_to_client[..s.bytes_produced], &mut scratch).unwrap();
            assert_eq!(u.bytes_produced, 0);
        }

        handshaking = c.handshake_status != HandshakeStatus::NotHandshaking
            || s.handshake_status != HandshakeStatus::NotHandshaking;
    }
    assert!(!handshaking, "engine-mode handshake did not converge");

    let payload = b"hello over the engine surface";
    let c = client.wrap(payload, &mut client_to_server).unwrap();
    assert_eq!(c.bytes_consumed, payload.len());
    let u = server.unwrap(&client_to_server[..c.bytes_produced], &mut scratch).unwrap();
    assert_eq!(&scratch[..u.bytes_produced], payload);

    client.close_outbound().unwrap();
    let c = client.wrap(&[], &mut client_to_server).unwrap();
    assert_eq!(c.status, EngineStatus::Closed);
    let u = server.unwrap(&client_to_server[..c.bytes_produced], &mut scratch).unwrap();
    assert_eq!(u.status, EngineStatus::Closed);
}

/// Drives a False-Start-enabled client far enough to prove the cut-through
/// window is real: the client reaches `ReadyHandshakeCutThrough` and can
/// send application data *before* it has seen the server's `Finished`, and
/// the server can decrypt that data immediately because it already holds
/// the client's write keys from the client's own `Finished` flight.
#[test]
fn false_start_lets_a_client_send_application_data_before_the_handshake_finishes() {
    let leaf = generate_leaf("falsestart.example.com");
    let server_name = rustls::ServerName::try_from("falsestart.example.com").unwrap();

    let client_config = ConnectionConfig::builder().build();
    let server_config_handle = server_connection_config(&leaf);

    let mut client = Connection::client_engine(server_name, client_config, true).unwrap();
    let mut server = Connection::server_engine(server_config_handle).unwrap();

    let mut c_buf = vec![0u8; 16 * 1024];
    let mut s_buf = vec![0u8; 16 * 1024];
    let mut scratch = vec![0u8; 16 * 1024];

    // ClientHello.
    let c1 = client.wrap(&[], &mut c_buf).unwrap();
    assert!(c1.bytes_produced > 0);
    let u1 = server.unwrap(&c_buf[..c1.bytes_produced], &mut scratch).unwrap();
    assert_eq!(u1.bytes_produced, 0);

    // ServerHello .. ServerHelloDone.
    let s1 = server.wrap(&[], &mut s_buf).unwrap();
    assert!(s1.bytes_produced > 0);
    let u2 = client.unwrap(&s_buf[..s1.bytes_produced], &mut scratch).unwrap();
    assert_eq!(u2.bytes_produced, 0);
    // The server's flight still needs answering; the cut-through window
    // has not opened yet.
    assert_eq!(client.state(), ConnState::HandshakeStarted);

    // ClientKeyExchange, ChangeCipherSpec, Finished -- flushed by the next
    // wrap() even with an empty payload. Once this is on the wire the
    // client has nothing left to write but still needs the server's
    // Finished, so refresh_state_after_io should promote it straight to
    // ReadyHandshakeCutThrough.
    let c2 = client.wrap(&[], &mut c_buf).unwrap();
    assert!(c2.bytes_produced > 0);
    assert_eq!(
        client.state(),
        ConnState::ReadyHandshakeCutThrough,
        "client should be in the False Start window after flushing its own Finished"
    );

    // The cut-through window is exactly where application data may flow,
    // but hold off delivering the client's Finished to the server until
    // after that payload is produced, to prove it really was available
    // before the server had anything further from the client.
    let payload = b"sent before the server's Finished arrives";
    let mut payload_buf = vec![0u8; 4096];
    let c3 = client.wrap(payload, &mut payload_buf).unwrap();
    assert_eq!(c3.bytes_consumed, payload.len());
    assert!(c3.bytes_produced > 0);

    // Deliver the client's Finished flight; the server can already
    // decrypt application data at this point even though it hasn't sent
    // its own Finished back yet.
    let u3 = server.unwrap(&c_buf[..c2.bytes_produced], &mut scratch).unwrap();
    assert_eq!(u3.bytes_produced, 0);
    let u3b = server.unwrap(&payload_buf[..c3.bytes_produced], &mut scratch).unwrap();
    assert_eq!(&scratch[..u3b.bytes_produced], payload);

    // Server's own ChangeCipherSpec/Finished.
    let s2 = server.wrap(&[], &mut s_buf).unwrap();
    assert!(s2.bytes_produced > 0);
    let u4 = client.unwrap(&s_buf[..s2.bytes_produced], &mut scratch).unwrap();
    assert_eq!(u4.bytes_produced, 0);

    // Now that the client has verified the server's Finished, the
    // cut-through promotes to a fully completed handshake.
    assert_eq!(client.state(), ConnState::Ready);
}

#[test]
fn memory_bio_pair_carries_handshake_bytes_without_a_real_socket() {
    let (mut a, mut b) = tls_provider::bio::memory::MemoryBioHalf::pair(4096);
    use tls_provider::bio::Bio;

    let mut out = [0u8; 3];
    matches!(a.write(b"hi!"), tls_provider::bio::BioResult::Ok(3));
    let n = match b.read(&mut out) {
        tls_provider::bio::BioResult::Ok(n) => n,
        other => panic!("expected Ok, got {other:?}"),
    };
    assert_eq!(&out[..n], b"hi!");
}
