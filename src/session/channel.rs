use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::attestation::types::VerifiedMeasurement;
use crate::attestation::{AttestationProvider, AttestationVerifier, TransparencyLog};
use crate::error::{Error, ProtocolError, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::message::{CancelNotice, ErrorNotice};
use crate::frame::{Flags, Frame, FrameType};
use crate::ratchet::GroupRatchet;

use super::handshake::{self, Established};
use super::{EnclaveConfig, SessionConfig};

/// A decrypted message received from a secure channel.
#[derive(Debug)]
pub enum Message {
    /// Encoded `InferenceRequest` chunk.
    Request { payload: Bytes, final_flag: bool },
    /// Encoded `InferenceResponse` chunk.
    Response { payload: Bytes, final_flag: bool },
    Cancel(CancelNotice),
    Error(ErrorNotice),
    Heartbeat,
    /// Peer-initiated shutdown.
    Shutdown,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Cancel(_) => "Cancel",
            Self::Error(_) => "Error",
            Self::Heartbeat => "Heartbeat",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Bidirectional encrypted channel over any `AsyncRead + AsyncWrite` transport.
///
/// Every frame is sealed under the current epoch of the session's
/// [`GroupRatchet`]. Any error other than a cancellation or rejection
/// discards the ratchet before it is returned, and the channel stays closed.
pub struct SecureChannel<T> {
    transport: T,
    read_buf: BytesMut,
    codec: FrameCodec,
    ratchet: GroupRatchet,
    peer: Option<VerifiedMeasurement>,
    last_sent_epoch: Option<u32>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> SecureChannel<T> {
    /// Establish a channel as the client, verifying the enclave's attestation.
    pub async fn connect(
        mut transport: T,
        verifier: &AttestationVerifier,
        log: &dyn TransparencyLog,
        config: &SessionConfig,
    ) -> Result<Self, Error> {
        let established = handshake::initiate(&mut transport, verifier, log, config).await?;
        Ok(Self::new(transport, established, config.max_payload_size))
    }

    /// Establish a channel as the enclave, providing its attestation.
    pub async fn accept(
        mut transport: T,
        provider: &dyn AttestationProvider,
        config: &EnclaveConfig,
    ) -> Result<Self, Error> {
        let established = handshake::respond(&mut transport, provider, config).await?;
        Ok(Self::new(transport, established, config.max_payload_size))
    }

    fn new(transport: T, established: Established, max_payload_size: u32) -> Self {
        Self {
            transport,
            read_buf: established.residual,
            codec: FrameCodec::with_max_payload_size(max_payload_size),
            ratchet: established.ratchet,
            peer: established.peer,
            last_sent_epoch: None,
        }
    }

    /// The enclave's verified measurement (client side only).
    pub fn peer(&self) -> Option<&VerifiedMeasurement> {
        self.peer.as_ref()
    }

    pub fn epoch(&self) -> u32 {
        self.ratchet.epoch()
    }

    /// Epoch of the last frame this side sent, if any.
    pub fn last_sent_epoch(&self) -> Option<u32> {
        self.last_sent_epoch
    }

    pub fn is_open(&self) -> bool {
        !self.ratchet.is_discarded()
    }

    pub fn ratchet(&self) -> &GroupRatchet {
        &self.ratchet
    }

    pub fn ratchet_mut(&mut self) -> &mut GroupRatchet {
        &mut self.ratchet
    }

    /// Seal `plaintext` as a frame of `msg_type` and write it.
    pub async fn send(
        &mut self,
        msg_type: FrameType,
        plaintext: &[u8],
        is_final: bool,
    ) -> Result<(), Error> {
        let result = self.send_inner(msg_type, plaintext, is_final).await;
        self.check(result)
    }

    async fn send_inner(
        &mut self,
        msg_type: FrameType,
        plaintext: &[u8],
        is_final: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let flags = if is_final {
            Flags::empty().with(Flags::FINAL)
        } else {
            Flags::empty()
        };
        let frame = self.ratchet.seal(msg_type, flags, plaintext)?;
        tracing::trace!(
            msg_type = ?msg_type,
            epoch = frame.header.epoch,
            sequence = frame.header.sequence,
            "frame sent"
        );
        let epoch = frame.header.epoch;
        self.send_frame(frame).await?;
        self.last_sent_epoch = Some(epoch);
        Ok(())
    }

    /// Send a heartbeat (sealed, empty payload).
    pub async fn heartbeat(&mut self) -> Result<(), Error> {
        self.send(FrameType::Heartbeat, &[], true).await
    }

    /// Receive the next frame of an in-flight exchange.
    ///
    /// The frame must belong to the current epoch. Fails with
    /// [`SessionError::ChunkTimeout`] if nothing arrives within `limit` and with
    /// [`SessionError::Closed`] if the peer disconnects.
    pub async fn recv_chunk(&mut self, limit: Duration) -> Result<Message, Error> {
        let result = match tokio::time::timeout(limit, self.recv_frame()).await {
            Ok(Ok(Some(frame))) => self.open(&frame),
            Ok(Ok(None)) => Err(SessionError::Closed.into()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::ChunkTimeout.into()),
        };
        self.check(result)
    }

    /// Receive the next frame while no request is in flight.
    ///
    /// A responder accepts a frame of the next epoch here and advances to it.
    /// Returns `None` on a clean disconnect or when `idle_limit` expires.
    pub async fn recv_idle(&mut self, idle_limit: Option<Duration>) -> Result<Option<Message>, Error> {
        let received = match idle_limit {
            Some(limit) => match tokio::time::timeout(limit, self.recv_frame()).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::info!(limit_ms = limit.as_millis() as u64, "idle timeout");
                    return Ok(None);
                }
            },
            None => self.recv_frame().await,
        };
        let result = match received {
            Ok(Some(frame)) => self
                .ratchet
                .follow(frame.header.epoch)
                .and_then(|()| self.open(&frame))
                .map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.check(result)
    }

    /// Send a shutdown frame, close the write half, and discard all keys.
    pub async fn close(&mut self) -> Result<(), Error> {
        if !self.is_open() {
            return Ok(());
        }
        let result = self.send(FrameType::Shutdown, &[], true).await;
        self.ratchet.discard();
        let _ = self.transport.shutdown().await;
        result
    }

    /// Tear the channel down immediately. Key material is destroyed before
    /// this returns.
    pub fn abort(&mut self) {
        if self.is_open() {
            tracing::warn!(epoch = self.ratchet.epoch(), "secure channel aborted");
        }
        self.ratchet.discard();
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::Closed.into())
        }
    }

    fn check<V>(&mut self, result: Result<V, Error>) -> Result<V, Error> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() && self.is_open() {
                tracing::warn!(kind = ?e.kind(), "secure channel torn down");
                self.ratchet.discard();
            }
        }
        result
    }

    fn open(&mut self, frame: &Frame) -> Result<Message, Error> {
        let plaintext = self.ratchet.open(frame)?;
        tracing::trace!(
            msg_type = ?frame.header.msg_type,
            epoch = frame.header.epoch,
            sequence = frame.header.sequence,
            "frame received"
        );
        let final_flag = frame.header.flags.is_final();
        match frame.header.msg_type {
            FrameType::Request => Ok(Message::Request {
                payload: plaintext,
                final_flag,
            }),
            FrameType::Response => Ok(Message::Response {
                payload: plaintext,
                final_flag,
            }),
            FrameType::Cancel => Ok(Message::Cancel(CancelNotice::decode(&plaintext)?)),
            FrameType::Error => Ok(Message::Error(ErrorNotice::decode(&plaintext)?)),
            FrameType::Heartbeat | FrameType::Shutdown if !plaintext.is_empty() => {
                Err(ProtocolError::MalformedChunk("control frame with payload").into())
            }
            FrameType::Heartbeat => Ok(Message::Heartbeat),
            FrameType::Shutdown => Ok(Message::Shutdown),
            FrameType::Hello => Err(SessionError::UnexpectedMessage {
                expected: "Request/Response/Cancel/Error/Heartbeat/Shutdown",
                actual: "Hello".to_string(),
            }
            .into()),
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.transport.write_all(&buf).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Read the next raw frame. `None` on a clean disconnect between frames.
    async fn recv_frame(&mut self) -> Result<Option<Frame>, Error> {
        self.ensure_open()?;
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }
            if self.transport.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::Closed.into());
            }
        }
    }
}
