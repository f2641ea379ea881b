use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameHeader, HEADER_SIZE};
use crate::error::FrameError;

/// Upper bound on a single `reserve` while waiting for a payload, so a peer
/// announcing a huge `payload_len` cannot force one large allocation.
const MAX_RESERVE_STEP: usize = 64 * 1024;

/// Tokio codec for encoding/decoding frames on the wire.
#[derive(Debug)]
pub struct FrameCodec {
    /// Cached header from a partial decode.
    current_header: Option<FrameHeader>,
    /// Configured maximum payload size (enforced on decode and encode).
    max_payload_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            current_header: None,
            max_payload_size: super::MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a codec with a custom maximum payload size.
    pub fn with_max_payload_size(max_payload_size: u32) -> Self {
        Self {
            current_header: None,
            max_payload_size: max_payload_size.min(super::MAX_PAYLOAD_SIZE),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.current_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        if header.payload_len > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: header.payload_len,
                max: self.max_payload_size,
            });
        }

        let payload_len = header.payload_len as usize;
        if src.len() < payload_len {
            src.reserve((payload_len - src.len()).min(MAX_RESERVE_STEP));
            self.current_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        if len > self.max_payload_size as usize || len != frame.header.payload_len as usize {
            return Err(FrameError::PayloadTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.max_payload_size,
            });
        }
        dst.reserve(HEADER_SIZE + len);
        frame.header.encode(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
