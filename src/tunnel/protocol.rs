//! Binary frame protocol for the tunnel WebSocket.
//!
//! Frame layout (both directions): a 4-character ASCII hex request id,
//! followed by an opaque payload that runs to the end of the WebSocket
//! message. There is no length prefix — the WebSocket message boundary
//! *is* the frame boundary.
//!
//! ```text
//! | id (4 ASCII hex chars) | payload (NB) |
//! ```

use bytes::{Bytes, BytesMut};

/// Width, in ASCII characters, of the request id field.
pub const ID_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than the {ID_LEN}-byte id field: got {0} bytes")]
    TooShort(usize),
    #[error("id field is not 4 ASCII hex digits")]
    BadId,
}

/// Decode an inbound request frame: `(request_id, payload)`.
pub fn decode_request(mut data: Vec<u8>) -> Result<(u16, Bytes), FrameError> {
    if data.len() < ID_LEN {
        return Err(FrameError::TooShort(data.len()));
    }
    let id_str = std::str::from_utf8(&data[..ID_LEN]).map_err(|_| FrameError::BadId)?;
    let id = u16::from_str_radix(id_str, 16).map_err(|_| FrameError::BadId)?;
    let payload = data.split_off(ID_LEN);
    Ok((id, Bytes::from(payload)))
}

/// Encode an outbound response frame: lowercase, zero-padded 4-hex-digit id
/// followed by the response payload.
pub fn encode_response(id: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ID_LEN + payload.len());
    buf.extend_from_slice(format!("{id:04x}").as_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_short_frames() {
        assert!(matches!(
            decode_request(vec![b'0', b'0']),
            Err(FrameError::TooShort(2))
        ));
    }

    #[test]
    fn decode_rejects_non_hex_id() {
        assert!(matches!(
            decode_request(b"zzzzpayload".to_vec()),
            Err(FrameError::BadId)
        ));
    }

    #[test]
    fn decode_splits_id_and_payload() {
        let (id, payload) = decode_request(b"002aGET / HTTP/1.1".to_vec()).unwrap();
        assert_eq!(id, 0x002a);
        assert_eq!(&payload[..], b"GET / HTTP/1.1");
    }

    #[test]
    fn decode_allows_empty_payload() {
        let (id, payload) = decode_request(b"0000".to_vec()).unwrap();
        assert_eq!(id, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn encode_is_lowercase_zero_padded() {
        let frame = encode_response(0, b"hi");
        assert_eq!(&frame[..], b"0000hi");
        let frame = encode_response(0xabcd, b"");
        assert_eq!(&frame[..], b"abcd");
    }

    #[test]
    fn round_trip_across_id_space() {
        for id in [0u16, 1, 0x002a, 0xffff] {
            let payload = b"some opaque bytes";
            let frame = encode_response(id, payload);
            let (decoded_id, decoded_payload) = decode_request(frame.to_vec()).unwrap();
            assert_eq!(decoded_id, id);
            assert_eq!(&decoded_payload[..], payload);
        }
    }
}
