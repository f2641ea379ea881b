pub mod codec;
pub mod message;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Magic bytes: 0x74 0x53 ("tS", trusted speech).
pub const MAGIC: u16 = 0x7453;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 17;

/// Maximum payload size: 16 MiB.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Request = 0x02,
    Response = 0x03,
    Cancel = 0x04,
    Error = 0x05,
    Heartbeat = 0x06,
    Shutdown = 0x07,
}

impl FrameType {
    pub fn from_u8(v: u8) -> std::result::Result<Self, FrameError> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Request),
            0x03 => Ok(Self::Response),
            0x04 => Ok(Self::Cancel),
            0x05 => Ok(Self::Error),
            0x06 => Ok(Self::Heartbeat),
            0x07 => Ok(Self::Shutdown),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Frame flags (bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub(crate) u8);

impl Flags {
    pub const ENCRYPTED: u8 = 0x01;
    pub const FINAL: u8 = 0x02;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create flags from raw bits.
    pub const fn from_raw(bits: u8) -> Self {
        Self(bits)
    }

    /// Get the raw flag bits.
    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub const fn is_final(self) -> bool {
        self.0 & Self::FINAL != 0
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: FrameType,
    pub flags: Flags,
    pub epoch: u32,
    pub sequence: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encode the header into bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags.0);
        buf.put_u32(self.epoch);
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload_len);
    }

    /// Decode a header from a buffer. Returns `None` if not enough bytes.
    pub fn decode(buf: &mut BytesMut) -> std::result::Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = &buf[..HEADER_SIZE];
        let magic = cursor.get_u16();
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let msg_type = FrameType::from_u8(cursor.get_u8())?;
        let flags = Flags(cursor.get_u8());
        let epoch = cursor.get_u32();
        let sequence = cursor.get_u32();
        let payload_len = cursor.get_u32();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.advance(HEADER_SIZE);

        Ok(Some(Self {
            version,
            msg_type,
            flags,
            epoch,
            sequence,
            payload_len,
        }))
    }
}

/// A complete frame: header + payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Create a plaintext hello frame (used during handshake only).
    pub fn hello(sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Hello, Flags::empty(), 0, sequence, payload)
    }

    /// Create an encrypted frame carrying a sealed payload.
    pub fn sealed(
        msg_type: FrameType,
        flags: Flags,
        epoch: u32,
        sequence: u32,
        ciphertext: Bytes,
    ) -> Self {
        Self::new(
            msg_type,
            flags.with(Flags::ENCRYPTED),
            epoch,
            sequence,
            ciphertext,
        )
    }

    fn new(msg_type: FrameType, flags: Flags, epoch: u32, sequence: u32, payload: Bytes) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                msg_type,
                flags,
                epoch,
                sequence,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }
}
