//! Session and session cache.
//!
//! A `Session` is an opaque, serialisable handle: id bytes, cipher and
//! protocol names, creation time, optional SNI hostname. Sessions may be
//! created implicitly on successful handshake or supplied by the
//! consumer for resumption. The cache is its own concurrent container
//! with internal locking: a `Mutex`-guarded bounded LRU keyed by session
//! id.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use der::asn1::{OctetString, Utf8String};
use der::{Decode, Encode, Sequence};
use sha2::Digest;

use crate::error::{Error, ErrorKind};

/// Default bound on the number of sessions kept in a [`SessionCache`]:
/// a number that fits a single process comfortably without unbounded
/// growth.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Sequence)]
struct SessionAsn1 {
    id: OctetString,
    cipher: Utf8String,
    protocol: Utf8String,
    created_ms: u64,
    sni: Option<Utf8String>,
}

/// Opaque handle to a TLS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: Vec<u8>,
    cipher: String,
    protocol: String,
    created_ms: u64,
    sni: Option<String>,
}

impl Session {
    /// Synthesises a session id as SHA-256 of the negotiated cipher,
    /// protocol, and peer chain -- `rustls` does not expose a raw TLS
    /// session id once a handshake has unified TLS 1.2/1.3 resumption
    /// internally, so this crate mints its own 32-byte identifier the
    /// same way a BoringSSL-style session object would hand back one on
    /// `SSL_get_session`.
    pub fn new(cipher: &str, protocol: &str, peer_chain: &[Vec<u8>], sni: Option<&str>) -> Self {
        let mut hasher = sha2::Sha256::new();
        hasher.update(cipher.as_bytes());
        hasher.update(protocol.as_bytes());
        for cert in peer_chain {
            hasher.update(cert);
        }
        let id: [u8; 32] = hasher.finalize().into();

        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            id: id.to_vec(),
            cipher: cipher.to_string(),
            protocol: protocol.to_string(),
            created_ms,
            sni: sni.map(str::to_string),
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Milliseconds since the epoch. The primitive library reports
    /// seconds; this crate documents the ×1000 the same way a
    /// Java-facing API would, to match callers' expectations.
    pub fn time_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    /// DER encoding.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let asn1 = SessionAsn1 {
            id: OctetString::new(self.id.clone())
                .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?,
            cipher: Utf8String::new(&self.cipher)
                .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?,
            protocol: Utf8String::new(&self.protocol)
                .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?,
            created_ms: self.created_ms,
            sni: self
                .sni
                .as_ref()
                .map(|s| Utf8String::new(s))
                .transpose()
                .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?,
        };
        asn1.to_der()
            .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))
    }

    /// `decode(bytes) -> Session|ParseError`.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let asn1 = SessionAsn1::from_der(bytes)
            .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?;
        Ok(Self {
            id: asn1.id.as_bytes().to_vec(),
            cipher: asn1.cipher.to_string(),
            protocol: asn1.protocol.to_string(),
            created_ms: asn1.created_ms,
            sni: asn1.sni.map(|s| s.to_string()),
        })
    }
}

struct CacheInner {
    order: VecDeque<Vec<u8>>,
    entries: HashMap<Vec<u8>, Session>,
    capacity: usize,
}

/// Bounded LRU session cache keyed by session id, with its own internal
/// locking.
pub struct SessionCache {
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn insert(&self, session: Session) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let id = session.id().to_vec();
        if inner.entries.insert(id.clone(), session).is_none() {
            inner.order.push_back(id);
        }
        while inner.order.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &[u8]) -> Option<Session> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.get(id).cloned()
    }

    pub fn remove(&self, id: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.remove(id);
        inner.order.retain(|e| e != id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_id() {
        let session = Session::new("TLS_AES_128_GCM_SHA256", "TLSv1.2", &[vec![1, 2, 3]], Some("example.com"));
        let encoded = session.encode().unwrap();
        let decoded = Session::decode(&encoded).unwrap();
        let reencoded = decoded.encode().unwrap();
        let redecoded = Session::decode(&reencoded).unwrap();
        assert_eq!(session.id(), redecoded.id());
        assert_eq!(session, decoded);
    }

    #[test]
    fn session_id_is_32_bytes() {
        let session = Session::new("TLS_AES_128_GCM_SHA256", "TLSv1.2", &[], None);
        assert_eq!(session.id().len(), 32);
    }

    #[test]
    fn cache_evicts_oldest_beyond_capacity() {
        let cache = SessionCache::new(2);
        let a = Session::new("A", "TLSv1.2", &[vec![1]], None);
        let b = Session::new("B", "TLSv1.2", &[vec![2]], None);
        let c = Session::new("C", "TLSv1.2", &[vec![3]], None);
        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.insert(c.clone());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(a.id()).is_none());
        assert!(cache.get(b.id()).is_some());
        assert!(cache.get(c.id()).is_some());
    }

    #[test]
    fn decode_garbage_is_parse_error() {
        let err = Session::decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }
}
