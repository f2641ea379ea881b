//! Structural validation of request/response chunk streams.
//!
//! The codec knows nothing about keys. It checks that every chunk of a
//! logical request carries the same request id, that response sequences
//! start at 0 and increase by one, that each direction finishes exactly once,
//! and that inbound data per request (text on the responder, audio on the
//! initiator) stays under the reassembly ceiling.

use bytes::Bytes;

use crate::error::{Error, ProtocolError, ResourceError, SessionError};
use crate::frame::message::{InferenceRequest, InferenceResponse, RequestId};
use crate::ratchet::Role;

/// Default ceiling on buffered request text per in-flight request (1 MiB).
pub const DEFAULT_REASSEMBLY_LIMIT: usize = 1024 * 1024;

/// Default ceiling on audio received per request (64 MiB, about 23 minutes
/// of 16-bit mono at 24 kHz).
pub const DEFAULT_RESPONSE_LIMIT: usize = 64 * 1024 * 1024;

/// A fully received request, ready for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRequest {
    pub request_id: RequestId,
    pub voice: String,
    pub speed: f32,
    pub text: String,
}

#[derive(Debug, Default)]
struct HalfStream {
    next_sequence: u32,
    finished: bool,
}

#[derive(Debug)]
struct RequestStream {
    id: RequestId,
    sent: HalfStream,
    received: HalfStream,
    /// Voice and speed pinned by the first request chunk.
    params: Option<(String, f32)>,
    text: String,
    audio_bytes: usize,
}

impl RequestStream {
    fn new(id: RequestId) -> Self {
        Self {
            id,
            sent: HalfStream::default(),
            received: HalfStream::default(),
            params: None,
            text: String::new(),
            audio_bytes: 0,
        }
    }
}

/// Chunk framing and validation for one side of a session.
///
/// The initiator encodes requests and decodes responses; the responder does
/// the reverse. At most one request is in flight at a time.
#[derive(Debug)]
pub struct StreamCodec {
    role: Role,
    reassembly_limit: usize,
    current: Option<RequestStream>,
}

impl StreamCodec {
    pub fn new(role: Role, reassembly_limit: usize) -> Self {
        Self {
            role,
            reassembly_limit,
            current: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Id of the in-flight request, if any.
    pub fn in_flight(&self) -> Option<RequestId> {
        self.current.as_ref().map(|r| r.id)
    }

    /// Whether both directions of the in-flight request have finished.
    pub fn is_complete(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|r| r.sent.finished && r.received.finished)
    }

    /// Open a new request on the initiator side.
    pub fn begin(&mut self, request_id: RequestId) -> Result<(), Error> {
        self.expect_role(Role::Initiator)?;
        if self.current.is_some() {
            return Err(SessionError::InvalidState("request already in flight").into());
        }
        self.current = Some(RequestStream::new(request_id));
        Ok(())
    }

    /// Encode the next outbound text chunk (initiator).
    pub fn encode_request(
        &mut self,
        voice: &str,
        speed: f32,
        text: &str,
        is_final: bool,
    ) -> Result<Bytes, Error> {
        self.expect_role(Role::Initiator)?;
        let stream = self
            .current
            .as_mut()
            .ok_or(SessionError::InvalidState("no request in flight"))?;
        if stream.sent.finished {
            return Err(SessionError::InvalidState("request already finalized").into());
        }
        stream.sent.next_sequence = stream.sent.next_sequence.saturating_add(1);
        stream.sent.finished = is_final;
        Ok(InferenceRequest {
            request_id: stream.id,
            voice: voice.to_owned(),
            speed,
            text: text.to_owned(),
            is_final,
        }
        .encode())
    }

    /// Decode and validate an inbound response chunk (initiator).
    pub fn decode_response(&mut self, payload: &[u8]) -> Result<InferenceResponse, Error> {
        self.expect_role(Role::Initiator)?;
        let chunk = InferenceResponse::decode(payload)?;
        let limit = self.reassembly_limit;
        let stream = self
            .current
            .as_mut()
            .ok_or(ProtocolError::MalformedChunk("response without a request"))?;
        if chunk.request_id != stream.id {
            return Err(ProtocolError::RequestIdMismatch.into());
        }
        if !stream.sent.finished {
            return Err(ProtocolError::MalformedChunk("response before final request chunk").into());
        }
        if stream.received.finished {
            return Err(ProtocolError::MalformedChunk("chunk after final").into());
        }
        check_sequence(stream.received.next_sequence, chunk.sequence)?;
        let size = stream.audio_bytes.saturating_add(chunk.audio.len());
        if size > limit {
            return Err(ResourceError::ReassemblyBufferExceeded { size, limit }.into());
        }
        stream.audio_bytes = size;
        stream.received.next_sequence = stream.received.next_sequence.saturating_add(1);
        stream.received.finished = chunk.is_final;
        Ok(chunk)
    }

    /// Decode and buffer an inbound request chunk (responder).
    ///
    /// Returns the assembled request once its final chunk arrives. The first
    /// chunk of a request opens it.
    pub fn decode_request(&mut self, payload: &[u8]) -> Result<Option<AssembledRequest>, Error> {
        self.expect_role(Role::Responder)?;
        let chunk = InferenceRequest::decode(payload)?;
        let limit = self.reassembly_limit;
        let stream = self
            .current
            .get_or_insert_with(|| RequestStream::new(chunk.request_id));
        if chunk.request_id != stream.id {
            return Err(ProtocolError::RequestIdMismatch.into());
        }
        if stream.received.finished {
            return Err(ProtocolError::MalformedChunk("chunk after final").into());
        }

        match &stream.params {
            None => stream.params = Some((chunk.voice, chunk.speed)),
            Some((voice, speed)) => {
                if *voice != chunk.voice || speed.to_bits() != chunk.speed.to_bits() {
                    return Err(ProtocolError::MalformedChunk(
                        "voice or speed changed within a request",
                    )
                    .into());
                }
            }
        }

        let size = stream.text.len().saturating_add(chunk.text.len());
        if size > limit {
            return Err(ResourceError::ReassemblyBufferExceeded { size, limit }.into());
        }
        stream.text.push_str(&chunk.text);
        stream.received.next_sequence = stream.received.next_sequence.saturating_add(1);

        if !chunk.is_final {
            return Ok(None);
        }
        stream.received.finished = true;
        let (voice, speed) = stream.params.clone().unwrap_or_default();
        Ok(Some(AssembledRequest {
            request_id: stream.id,
            voice,
            speed,
            text: std::mem::take(&mut stream.text),
        }))
    }

    /// Encode the next outbound audio chunk (responder). Sequences start at 0.
    pub fn encode_response(&mut self, audio: Bytes, is_final: bool) -> Result<Bytes, Error> {
        self.expect_role(Role::Responder)?;
        let stream = self
            .current
            .as_mut()
            .ok_or(SessionError::InvalidState("no request in flight"))?;
        if !stream.received.finished {
            return Err(SessionError::InvalidState("request not fully received").into());
        }
        if stream.sent.finished {
            return Err(SessionError::InvalidState("response already finalized").into());
        }
        let sequence = stream.sent.next_sequence;
        stream.sent.next_sequence = sequence.saturating_add(1);
        stream.sent.finished = is_final;
        Ok(InferenceResponse {
            request_id: stream.id,
            sequence,
            audio,
            is_final,
        }
        .encode())
    }

    /// Close a request whose both directions have finished.
    pub fn finish(&mut self) -> Result<RequestId, Error> {
        if !self.is_complete() {
            return Err(SessionError::InvalidState("request not complete").into());
        }
        self.current
            .take()
            .map(|r| r.id)
            .ok_or_else(|| SessionError::InvalidState("no request in flight").into())
    }

    /// Drop the in-flight request and its buffered text.
    pub fn abandon(&mut self) -> Option<RequestId> {
        self.current.take().map(|r| r.id)
    }

    fn expect_role(&self, role: Role) -> Result<(), Error> {
        if self.role == role {
            Ok(())
        } else {
            Err(SessionError::InvalidState("operation not valid for this role").into())
        }
    }
}

fn check_sequence(expected: u32, received: u32) -> Result<(), ProtocolError> {
    if received < expected {
        Err(ProtocolError::DuplicateSequence { expected, received })
    } else if received > expected {
        Err(ProtocolError::OutOfOrderSequence { expected, received })
    } else {
        Ok(())
    }
}
