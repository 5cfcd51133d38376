//! Private-key delegation: wraps an opaque, caller-held key so it can
//! sign and decrypt without the bytes ever crossing into this crate.
//!
//! Lets an opaque, caller-held private key (hardware-backed or OS
//! keystore) stand in for a real `rustls` signing key. The public key
//! material is never exposed to the wrapper -- only a cached size in
//! bytes is known locally; everything else is an upcall.

use std::sync::Arc;

use crate::error::{Error, ErrorKind};

/// RSA padding modes a wrapped key may be asked to operate under.
/// `rsa_sign_raw` only ever accepts [`RsaPadding::Pkcs1v15`]; the other
/// variants exist for `rsa_decrypt`, which accepts any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaPadding {
    Pkcs1v15,
    OaepSha1,
    OaepSha256,
    None,
}

/// The caller-implemented side of the delegation: `sign`/`decrypt` over
/// material the library never sees directly.
pub trait KeyWrapper: Send + Sync {
    /// Raw PKCS#1 v1.5 signature over `digest`. The implementation signs
    /// the already-hashed digest; it does not hash `digest` itself.
    fn sign_raw(&self, digest: &[u8]) -> Result<Vec<u8>, Error>;

    /// Decrypts `ciphertext` under `padding`. `rsa_decrypt` never asks
    /// for a padding the wrapper doesn't expect to see; policy is
    /// entirely the caller's.
    fn decrypt(&self, ciphertext: &[u8], padding: RsaPadding) -> Result<Vec<u8>, Error>;

    /// ECDSA signature over `digest`, DER-encoded `(r, s)`.
    fn ecdsa_sign(&self, digest: &[u8]) -> Result<Vec<u8>, Error>;
}

/// `{ caller_private_key_handle, cached_size_bytes }`. Bound to an RSA
/// or EC key object for that object's lifetime; dropping this drops the
/// caller's private-key reference.
pub struct KeyExData {
    handle: Arc<dyn KeyWrapper>,
    cached_size_bytes: usize,
}

impl KeyExData {
    pub fn new(handle: Arc<dyn KeyWrapper>, cached_size_bytes: usize) -> Self {
        Self {
            handle,
            cached_size_bytes,
        }
    }

    /// `rsa_size`/`ecdsa_max_sig_size` callers read this without an
    /// upcall -- the size is cached locally at construction.
    pub fn size_bytes(&self) -> usize {
        self.cached_size_bytes
    }

    /// Duplication of a wrapped key is explicitly unsupported: the
    /// caller-held handle has no meaningful "copy" operation.
    pub fn duplicate(&self) -> Result<KeyExData, Error> {
        Err(Error::illegal_state(
            "duplication of a wrapped private key is not supported",
        ))
    }
}

/// `rsa_size(key)`: cached modulus size, no upcall.
pub fn rsa_size(key: &KeyExData) -> usize {
    key.cached_size_bytes
}

/// `rsa_sign_raw(key, in, padding)`. Fails `IllegalArgument` unless
/// `padding` is PKCS#1 v1.5; fails
/// `IllegalBlockSize` ("DATA_TOO_LARGE") if `max_out < rsa_size(key)`.
/// The upcall result is left-zero-padded to exactly `rsa_size(key)`; a
/// result longer than that is an error.
pub fn rsa_sign_raw(
    key: &KeyExData,
    digest: &[u8],
    padding: RsaPadding,
    max_out: usize,
) -> Result<Vec<u8>, Error> {
    if padding != RsaPadding::Pkcs1v15 {
        return Err(Error::new(ErrorKind::IllegalArgument, "unknown RSA signing padding"));
    }
    if max_out < key.cached_size_bytes {
        return Err(Error::new(ErrorKind::IllegalBlockSize, "output buffer too small for modulus"));
    }
    let mut sig = key
        .handle
        .sign_raw(digest)
        .map_err(|_| Error::new(ErrorKind::Ssl, "private key upcall failed"))?;
    if sig.len() > key.cached_size_bytes {
        return Err(Error::new(ErrorKind::Signature, "signature longer than modulus"));
    }
    if sig.len() < key.cached_size_bytes {
        let mut padded = vec![0u8; key.cached_size_bytes - sig.len()];
        padded.append(&mut sig);
        sig = padded;
    }
    Ok(sig)
}

/// `rsa_decrypt(key, in, padding)`. The upcalled cleartext is returned
/// as-is; `DATA_TOO_LARGE` if it would not fit `max_out`.
pub fn rsa_decrypt(
    key: &KeyExData,
    ciphertext: &[u8],
    padding: RsaPadding,
    max_out: usize,
) -> Result<Vec<u8>, Error> {
    let cleartext = key
        .handle
        .decrypt(ciphertext, padding)
        .map_err(|_| Error::new(ErrorKind::BadPadding, "private key decrypt upcall failed"))?;
    if cleartext.len() > max_out {
        return Err(Error::new(ErrorKind::IllegalBlockSize, "decrypted output too large for buffer"));
    }
    Ok(cleartext)
}

/// Upper bound on a DER ECDSA signature for a curve with the given group
/// order size in bits: two INTEGERs of at most `ceil(order_bits/8)+1`
/// bytes each (leading zero for sign), plus SEQUENCE/INTEGER tag-length
/// overhead.
pub fn ecdsa_max_sig_size(group_order_bits: u32) -> usize {
    let n = (group_order_bits as usize + 7) / 8;
    2 * (n + 3) + 3
}

/// `ecdsa_sign(key, digest)`. Result length must be `<=
/// ecdsa_max_sig_size(group_order_bits)`; shorter is fine as-is.
pub fn ecdsa_sign(key: &KeyExData, digest: &[u8], group_order_bits: u32) -> Result<Vec<u8>, Error> {
    let sig = key
        .handle
        .ecdsa_sign(digest)
        .map_err(|_| Error::new(ErrorKind::Ssl, "private key ECDSA upcall failed"))?;
    if sig.len() > ecdsa_max_sig_size(group_order_bits) {
        return Err(Error::new(ErrorKind::Signature, "ECDSA signature too large for curve"));
    }
    Ok(sig)
}

/// Adapts a [`KeyExData`] to `rustls::sign::SigningKey`/`Signer` so a
/// caller-held key can really sign a handshake transcript digest when
/// returned from a `ResolvesClientCert`/`ResolvesServerCert` answer.
pub struct RsaSigningKey {
    key: Arc<KeyExData>,
    scheme: rustls::SignatureScheme,
}

impl RsaSigningKey {
    pub fn new(key: Arc<KeyExData>, scheme: rustls::SignatureScheme) -> Self {
        Self { key, scheme }
    }
}

impl rustls::sign::SigningKey for RsaSigningKey {
    fn choose_scheme(&self, offered: &[rustls::SignatureScheme]) -> Option<Box<dyn rustls::sign::Signer>> {
        offered.contains(&self.scheme).then(|| {
            Box::new(RsaSigner {
                key: Arc::clone(&self.key),
                scheme: self.scheme,
            }) as Box<dyn rustls::sign::Signer>
        })
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        rustls::SignatureAlgorithm::RSA
    }
}

struct RsaSigner {
    key: Arc<KeyExData>,
    scheme: rustls::SignatureScheme,
}

impl rustls::sign::Signer for RsaSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(message);
        let max_out = self.key.size_bytes();
        rsa_sign_raw(&self.key, &digest, RsaPadding::Pkcs1v15, max_out)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> rustls::SignatureScheme {
        self.scheme
    }
}

/// The EC analogue of [`RsaSigningKey`].
pub struct EcdsaSigningKey {
    key: Arc<KeyExData>,
    scheme: rustls::SignatureScheme,
    group_order_bits: u32,
}

impl EcdsaSigningKey {
    pub fn new(key: Arc<KeyExData>, scheme: rustls::SignatureScheme, group_order_bits: u32) -> Self {
        Self {
            key,
            scheme,
            group_order_bits,
        }
    }
}

impl rustls::sign::SigningKey for EcdsaSigningKey {
    fn choose_scheme(&self, offered: &[rustls::SignatureScheme]) -> Option<Box<dyn rustls::sign::Signer>> {
        offered.contains(&self.scheme).then(|| {
            Box::new(EcdsaSigner {
                key: Arc::clone(&self.key),
                scheme: self.scheme,
                group_order_bits: self.group_order_bits,
            }) as Box<dyn rustls::sign::Signer>
        })
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        rustls::SignatureAlgorithm::ECDSA
    }
}

struct EcdsaSigner {
    key: Arc<KeyExData>,
    scheme: rustls::SignatureScheme,
    group_order_bits: u32,
}

impl rustls::sign::Signer for EcdsaSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(message);
        ecdsa_sign(&self.key, &digest, self.group_order_bits)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> rustls::SignatureScheme {
        self.scheme
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKey(Vec<u8>);
    impl KeyWrapper for FixedKey {
        fn sign_raw(&self, _digest: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }
        fn decrypt(&self, ciphertext: &[u8], _padding: RsaPadding) -> Result<Vec<u8>, Error> {
            Ok(ciphertext.to_vec())
        }
        fn ecdsa_sign(&self, _digest: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn rsa_sign_raw_rejects_non_pkcs1_padding() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![1; 256])), 256);
        let err = rsa_sign_raw(&key, b"digest", RsaPadding::OaepSha1, 256).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn rsa_sign_raw_rejects_small_max_out() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![1; 256])), 256);
        let err = rsa_sign_raw(&key, b"digest", RsaPadding::Pkcs1v15, 128).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalBlockSize);
    }

    #[test]
    fn rsa_sign_raw_left_zero_pads_short_signature() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![0xAB; 200])), 256);
        let sig = rsa_sign_raw(&key, b"digest", RsaPadding::Pkcs1v15, 256).unwrap();
        assert_eq!(sig.len(), 256);
        assert!(sig[..56].iter().all(|&b| b == 0));
        assert_eq!(&sig[56..], &[0xAB; 200][..]);
    }

    #[test]
    fn rsa_sign_raw_rejects_oversized_signature() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![1; 300])), 256);
        let err = rsa_sign_raw(&key, b"digest", RsaPadding::Pkcs1v15, 300).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Signature);
    }

    #[test]
    fn rsa_decrypt_rejects_oversized_output() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![])), 256);
        let err = rsa_decrypt(&key, &[1, 2, 3], RsaPadding::OaepSha256, 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalBlockSize);
    }

    #[test]
    fn ecdsa_sign_rejects_oversized_signature() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![0; 200])), 0);
        let err = ecdsa_sign(&key, b"digest", 256).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Signature);
    }

    #[test]
    fn duplicate_is_always_rejected() {
        let key = KeyExData::new(Arc::new(FixedKey(vec![])), 256);
        assert!(key.duplicate().is_err());
    }
}
