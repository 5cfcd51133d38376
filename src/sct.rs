//! Certificate Transparency SCT-list framing and log-id derivation.
//!
//! `SignedCertificateTimestampList` per RFC 6962 §3.2 is a two-byte
//! length-prefixed vector of two-byte length-prefixed `SerializedSCT`
//! elements. A CT log id is SHA-256 of the DER `SubjectPublicKeyInfo`.

use sha2::Digest;

use crate::error::{Error, ErrorKind};

fn put_u16_len(out: &mut Vec<u8>, len: usize) -> Result<(), Error> {
    if len > u16::MAX as usize {
        return Err(Error::new(ErrorKind::IllegalArgument, "SCT element too large for u16 length"));
    }
    out.extend_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

/// Encodes a list of raw SCT byte strings as an RFC 6962 §3.2
/// `SignedCertificateTimestampList`, including the outer length prefix.
pub fn encode_sct_list(scts: &[Vec<u8>]) -> Result<Vec<u8>, Error> {
    let mut inner = Vec::new();
    for sct in scts {
        put_u16_len(&mut inner, sct.len())?;
        inner.extend_from_slice(sct);
    }
    let mut out = Vec::with_capacity(inner.len() + 2);
    put_u16_len(&mut out, inner.len())?;
    out.extend_from_slice(&inner);
    Ok(out)
}

/// Decodes an RFC 6962 §3.2 `SignedCertificateTimestampList` back into
/// its individual SCT byte strings.
pub fn decode_sct_list(bytes: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    if bytes.len() < 2 {
        return Err(Error::new(ErrorKind::ParseError, "truncated SCT list outer length"));
    }
    let outer_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let body = &bytes[2..];
    if body.len() != outer_len {
        return Err(Error::new(ErrorKind::ParseError, "SCT list outer length mismatch"));
    }

    let mut scts = Vec::new();
    let mut i = 0;
    while i < body.len() {
        if body.len() - i < 2 {
            return Err(Error::new(ErrorKind::ParseError, "truncated SCT element length"));
        }
        let len = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
        let start = i + 2;
        let end = start + len;
        if end > body.len() {
            return Err(Error::new(ErrorKind::ParseError, "truncated SCT element"));
        }
        scts.push(body[start..end].to_vec());
        i = end;
    }
    Ok(scts)
}

/// A Certificate Transparency log id: SHA-256 of the log's DER-encoded
/// `SubjectPublicKeyInfo`.
pub fn ct_log_id(log_spki_der: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(log_spki_der).into()
}

/// Extracts the DER `SubjectPublicKeyInfo` from a leaf certificate and
/// hashes it into a CT log id. Used when a caller wants the log id for a
/// cert it already holds rather than a raw SPKI.
pub fn ct_log_id_from_cert_der(cert_der: &[u8]) -> Result<[u8; 32], Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))?;
    let spki_der = cert.public_key().raw;
    Ok(ct_log_id(spki_der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_sct_list() {
        let scts = vec![vec![1, 2, 3], vec![4, 5]];
        let encoded = encode_sct_list(&scts).unwrap();
        // outer length (2 + 3) + (2 + 2) = 9
        assert_eq!(&encoded[..2], &9u16.to_be_bytes());
        assert_eq!(decode_sct_list(&encoded).unwrap(), scts);
    }

    #[test]
    fn decode_rejects_outer_length_mismatch() {
        let err = decode_sct_list(&[0, 5, 1, 2]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn decode_empty_list_round_trips() {
        let encoded = encode_sct_list(&[]).unwrap();
        assert_eq!(encoded, vec![0, 0]);
        assert_eq!(decode_sct_list(&encoded).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn log_id_is_sha256_of_spki() {
        let spki = b"fake-spki-der-bytes";
        let id = ct_log_id(spki);
        assert_eq!(id.len(), 32);
        assert_eq!(id, ct_log_id(spki));
    }
}
