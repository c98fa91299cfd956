use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "SM" (0x53 0x4D).
pub const MAGIC: [u8; 2] = [0x53, 0x4D];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Encode one frame into `dst`.
///
/// ```text
/// ┌────────────┬──────────────┬──────────────────┐
/// │ Magic (2B) │ Length (4B)  │ Payload          │
/// │ "SM"       │ u32 LE       │ (Length bytes)   │
/// └────────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until `src` holds a complete frame; only then are the
/// frame bytes consumed.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + len {
        src.reserve(HEADER_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Framing limits and blocking-socket timeouts.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to blocking streams.
    pub read_timeout: Option<Duration>,
    /// Write timeout applied to blocking streams.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl FrameConfig {
    /// Override the maximum payload size.
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Apply one timeout to both reads and writes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self.write_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(b"print(1)", &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 8);

        let payload = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"print(1)");
        assert!(buf.is_empty());
    }

    #[test]
    fn short_header_needs_more() {
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), 2, "nothing consumed");
    }

    #[test]
    fn partial_payload_needs_more() {
        let mut buf = BytesMut::new();
        encode_frame(b"incomplete", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 3);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 3, "nothing consumed");
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = BytesMut::from(&[0x49, 0x50, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidMagic)
        ));
    }

    #[test]
    fn oversized_length_rejected_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);

        assert!(matches!(
            decode_frame(&mut buf, 512),
            Err(FrameError::PayloadTooLarge {
                size: 1024,
                max: 512
            })
        ));
    }

    #[test]
    fn back_to_back_frames_and_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf).unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        let first = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let second = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(first.is_empty());
        assert_eq!(second.as_ref(), b"second");
        assert!(buf.is_empty());
    }
}
