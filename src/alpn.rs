//! ALPN protocol-list framing.
//!
//! The wire form is a concatenation of `len (1 byte) || bytes` elements.
//! Treating this as an opaque string is a mistake: a zero-length
//! protocol name is a protocol error, not a valid empty element.

use crate::error::{Error, ErrorKind};

/// Encodes an ordered protocol list as `len || bytes, len || bytes, ...`.
/// Fails `IllegalArgument` if any protocol is empty or longer than 255
/// bytes (the one-byte length prefix cannot represent more).
pub fn encode_protocol_list(protocols: &[Vec<u8>]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(protocols.iter().map(|p| p.len() + 1).sum());
    for p in protocols {
        if p.is_empty() {
            return Err(Error::new(ErrorKind::IllegalArgument, "zero-length ALPN protocol"));
        }
        if p.len() > u8::MAX as usize {
            return Err(Error::new(ErrorKind::IllegalArgument, "ALPN protocol longer than 255 bytes"));
        }
        out.push(p.len() as u8);
        out.extend_from_slice(p);
    }
    Ok(out)
}

/// Decodes a `len || bytes, ...` byte sequence into its protocol list.
/// `ParseError` on truncation or a zero-length element.
pub fn decode_protocol_list(bytes: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let mut protocols = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let len = bytes[i] as usize;
        if len == 0 {
            return Err(Error::new(ErrorKind::ParseError, "zero-length ALPN protocol"));
        }
        let start = i + 1;
        let end = start + len;
        if end > bytes.len() {
            return Err(Error::new(ErrorKind::ParseError, "truncated ALPN protocol list"));
        }
        protocols.push(bytes[start..end].to_vec());
        i = end;
    }
    Ok(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_protocol_list() {
        let protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let encoded = encode_protocol_list(&protocols).unwrap();
        assert_eq!(encoded, b"\x02h2\x08http/1.1");
        assert_eq!(decode_protocol_list(&encoded).unwrap(), protocols);
    }

    #[test]
    fn encode_rejects_empty_protocol() {
        let err = encode_protocol_list(&[Vec::new()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn decode_rejects_zero_length_element() {
        let err = decode_protocol_list(&[0]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn decode_rejects_truncated_list() {
        let err = decode_protocol_list(&[5, b'h', b'i']).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn decode_empty_bytes_is_empty_list() {
        assert_eq!(decode_protocol_list(&[]).unwrap(), Vec::<Vec<u8>>::new());
    }
}
