//! Payload layouts carried inside frames.
//!
//! All integers are big-endian. Variable-length fields are prefixed with a
//! `u32` length; booleans are a single `0`/`1` byte. Every decoder is
//! canonical: it rejects truncated input, out-of-range lengths, and trailing
//! bytes.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::ProtocolError;

/// Wire length of a request identifier.
pub const REQUEST_ID_LEN: usize = 16;

/// Upper bound on the voice selector length accepted off the wire.
pub const MAX_VOICE_LEN: usize = 256;

/// Identifier shared by every chunk of one logical request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn random() -> Self {
        let mut id = [0u8; REQUEST_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

/// Client challenge opening the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientChallenge {
    pub nonce: [u8; 32],
}

/// Enclave reply carrying its attestation material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationResponse {
    pub quote: Bytes,
    pub key_package: Bytes,
    pub binding_signature: Bytes,
}

/// Client half of the key exchange, with key confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub client_public: [u8; 32],
    pub confirmation: [u8; 32],
}

/// One unit of outbound text.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub request_id: RequestId,
    pub voice: String,
    pub speed: f32,
    pub text: String,
    pub is_final: bool,
}

/// One unit of returned audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse {
    pub request_id: RequestId,
    pub sequence: u32,
    pub audio: Bytes,
    pub is_final: bool,
}

/// Request cancellation (client) or its acknowledgement (enclave).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelNotice {
    pub request_id: RequestId,
}

/// Request-level failure reported by the enclave. `kind` never carries
/// plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub request_id: RequestId,
    pub kind: String,
}

// -- Field helpers --

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], ProtocolError> {
    if cursor.remaining() < N {
        return Err(ProtocolError::MalformedChunk("truncated fixed-size field"));
    }
    let mut out = [0u8; N];
    cursor.copy_to_slice(&mut out);
    Ok(out)
}

fn get_bytes<'a>(cursor: &mut &'a [u8], max: usize) -> Result<&'a [u8], ProtocolError> {
    if cursor.remaining() < 4 {
        return Err(ProtocolError::MalformedChunk("truncated length prefix"));
    }
    let len = cursor.get_u32() as usize;
    if len > max || len > cursor.remaining() {
        return Err(ProtocolError::MalformedChunk("field length out of range"));
    }
    let (field, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(field)
}

fn get_string(cursor: &mut &[u8], max: usize) -> Result<String, ProtocolError> {
    let raw = get_bytes(cursor, max)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::MalformedChunk("invalid utf-8"))
}

fn get_bool(cursor: &mut &[u8]) -> Result<bool, ProtocolError> {
    match get_array::<1>(cursor)?[0] {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::MalformedChunk("invalid boolean")),
    }
}

fn finish(cursor: &[u8]) -> Result<(), ProtocolError> {
    if cursor.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedChunk("trailing bytes"))
    }
}

impl ClientChallenge {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.nonce)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let nonce = get_array(&mut cursor)?;
        finish(cursor)?;
        Ok(Self { nonce })
    }
}

impl AttestationResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            12 + self.quote.len() + self.key_package.len() + self.binding_signature.len(),
        );
        put_bytes(&mut buf, &self.quote);
        put_bytes(&mut buf, &self.key_package);
        put_bytes(&mut buf, &self.binding_signature);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let quote = Bytes::copy_from_slice(get_bytes(&mut cursor, payload.len())?);
        let key_package = Bytes::copy_from_slice(get_bytes(&mut cursor, payload.len())?);
        let binding_signature = Bytes::copy_from_slice(get_bytes(&mut cursor, payload.len())?);
        finish(cursor)?;
        Ok(Self {
            quote,
            key_package,
            binding_signature,
        })
    }
}

impl KeyExchange {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&self.client_public);
        buf.put_slice(&self.confirmation);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let client_public = get_array(&mut cursor)?;
        let confirmation = get_array(&mut cursor)?;
        finish(cursor)?;
        Ok(Self {
            client_public,
            confirmation,
        })
    }
}

impl InferenceRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(REQUEST_ID_LEN + 13 + self.voice.len() + self.text.len());
        buf.put_slice(&self.request_id.0);
        put_bytes(&mut buf, self.voice.as_bytes());
        buf.put_f32(self.speed);
        put_bytes(&mut buf, self.text.as_bytes());
        buf.put_u8(self.is_final as u8);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let request_id = RequestId(get_array(&mut cursor)?);
        let voice = get_string(&mut cursor, MAX_VOICE_LEN)?;
        let speed = f32::from_be_bytes(get_array(&mut cursor)?);
        let text = get_string(&mut cursor, payload.len())?;
        let is_final = get_bool(&mut cursor)?;
        finish(cursor)?;
        Ok(Self {
            request_id,
            voice,
            speed,
            text,
            is_final,
        })
    }
}

impl InferenceResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_ID_LEN + 9 + self.audio.len());
        buf.put_slice(&self.request_id.0);
        buf.put_u32(self.sequence);
        put_bytes(&mut buf, &self.audio);
        buf.put_u8(self.is_final as u8);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let request_id = RequestId(get_array(&mut cursor)?);
        let sequence = u32::from_be_bytes(get_array(&mut cursor)?);
        let audio = Bytes::copy_from_slice(get_bytes(&mut cursor, payload.len())?);
        let is_final = get_bool(&mut cursor)?;
        finish(cursor)?;
        Ok(Self {
            request_id,
            sequence,
            audio,
            is_final,
        })
    }
}

impl CancelNotice {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.request_id.0)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let request_id = RequestId(get_array(&mut cursor)?);
        finish(cursor)?;
        Ok(Self { request_id })
    }
}

impl ErrorNotice {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_ID_LEN + 4 + self.kind.len());
        buf.put_slice(&self.request_id.0);
        put_bytes(&mut buf, self.kind.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let request_id = RequestId(get_array(&mut cursor)?);
        let kind = get_string(&mut cursor, 1024)?;
        finish(cursor)?;
        Ok(Self { request_id, kind })
    }
}
