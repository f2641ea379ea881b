use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroize;

use crate::attestation::AttestationProvider;
use crate::billing::{billable_characters, BillingMode, BillingReporter};
use crate::error::{Error, ProtocolError, SessionError};
use crate::frame::message::{CancelNotice, ErrorNotice};
use crate::frame::FrameType;
use crate::ratchet::Role;
use crate::stream::{AssembledRequest, StreamCodec};
use crate::synthesis::{self, split_chunks, Rejection, SpeechSynthesizer};

use super::channel::{Message, SecureChannel};
use super::EnclaveConfig;

/// Counters for one served session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub completed: u32,
    pub cancelled: u32,
    pub rejected: u32,
    pub characters_billed: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Enclave end of an attested session.
///
/// Reassembles request text, runs synthesis, streams encrypted audio back,
/// and reports usage after each completed request.
pub struct EnclaveSession<T> {
    channel: SecureChannel<T>,
    stream: StreamCodec,
    config: EnclaveConfig,
}

impl<T: AsyncRead + AsyncWrite + Unpin> EnclaveSession<T> {
    /// Answer the client's handshake over `transport`.
    pub async fn accept(
        transport: T,
        provider: &dyn AttestationProvider,
        config: EnclaveConfig,
    ) -> Result<Self, Error> {
        let channel = SecureChannel::accept(transport, provider, &config).await?;
        Ok(Self {
            channel,
            stream: StreamCodec::new(Role::Responder, config.reassembly_limit),
            config,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.channel.epoch()
    }

    /// Serve requests until the client shuts down, disconnects, or goes idle
    /// past `idle_timeout`.
    ///
    /// Any protocol, cryptographic, or resource violation tears the session
    /// down and is returned. Keys are discarded on every exit path.
    pub async fn serve(
        mut self,
        synthesizer: &dyn SpeechSynthesizer,
        billing: &dyn BillingReporter,
    ) -> Result<ServeSummary, Error> {
        let mut summary = ServeSummary::default();
        let result = self.serve_loop(synthesizer, billing, &mut summary).await;
        self.stream.abandon();
        self.channel.abort();
        match result {
            Ok(()) => {
                tracing::info!(
                    completed = summary.completed,
                    cancelled = summary.cancelled,
                    rejected = summary.rejected,
                    "session finished"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(kind = ?e.kind(), "session failed");
                Err(e)
            }
        }
    }

    async fn serve_loop(
        &mut self,
        synthesizer: &dyn SpeechSynthesizer,
        billing: &dyn BillingReporter,
        summary: &mut ServeSummary,
    ) -> Result<(), Error> {
        loop {
            let msg = if self.stream.in_flight().is_some() {
                self.channel.recv_chunk(self.config.chunk_timeout).await?
            } else {
                match self.channel.recv_idle(self.config.idle_timeout).await? {
                    Some(msg) => msg,
                    None => return Ok(()),
                }
            };
            match self.handle(msg, synthesizer, billing, summary).await? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    async fn handle(
        &mut self,
        msg: Message,
        synthesizer: &dyn SpeechSynthesizer,
        billing: &dyn BillingReporter,
        summary: &mut ServeSummary,
    ) -> Result<Flow, Error> {
        match msg {
            Message::Request {
                payload,
                final_flag,
            } => {
                let assembled = self.stream.decode_request(&payload)?;
                if assembled.is_some() != final_flag {
                    return Err(ProtocolError::MalformedChunk("final flag disagrees with frame").into());
                }
                if let Some(request) = assembled {
                    self.fulfil(request, synthesizer, billing, summary).await?;
                }
                Ok(Flow::Continue)
            }
            Message::Cancel(notice) => {
                match self.stream.in_flight() {
                    Some(id) if id == notice.request_id => {
                        self.stream.abandon();
                        summary.cancelled += 1;
                        tracing::debug!(request_id = %id, "request cancelled");
                    }
                    Some(_) => return Err(ProtocolError::RequestIdMismatch.into()),
                    // Already answered; the echo still lets the client resync.
                    None => {}
                }
                let echo = CancelNotice {
                    request_id: notice.request_id,
                };
                self.channel
                    .send(FrameType::Cancel, &echo.encode(), true)
                    .await?;
                Ok(Flow::Continue)
            }
            Message::Heartbeat => Ok(Flow::Continue),
            Message::Shutdown => {
                tracing::debug!("client shut the session down");
                Ok(Flow::Stop)
            }
            other => Err(SessionError::UnexpectedMessage {
                expected: "Request/Cancel/Heartbeat/Shutdown",
                actual: other.name().to_string(),
            }
            .into()),
        }
    }

    async fn fulfil(
        &mut self,
        mut request: AssembledRequest,
        synthesizer: &dyn SpeechSynthesizer,
        billing: &dyn BillingReporter,
        summary: &mut ServeSummary,
    ) -> Result<(), Error> {
        let outcome = self.render(&request, synthesizer).await;
        let characters = billable_characters(&request.text);
        request.text.zeroize();

        let audio = match outcome {
            Ok(audio) => audio,
            Err(rejection) => {
                self.stream.abandon();
                summary.rejected += 1;
                tracing::warn!(request_id = %request.request_id, kind = rejection.as_str(), "request rejected");
                let notice = ErrorNotice {
                    request_id: request.request_id,
                    kind: rejection.as_str().to_string(),
                };
                return self
                    .channel
                    .send(FrameType::Error, &notice.encode(), true)
                    .await;
            }
        };

        let chunks = split_chunks(audio, self.config.response_chunk_size);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let is_final = i == last;
            let payload = self.stream.encode_response(chunk, is_final)?;
            self.channel
                .send(FrameType::Response, &payload, is_final)
                .await?;
        }
        let request_id = self.stream.finish()?;
        summary.completed += 1;

        if self.config.billing_mode == BillingMode::PerRequest {
            billing.report(request_id, characters).await;
            summary.characters_billed += characters;
        }
        tracing::debug!(%request_id, chunks = last + 1, "request completed");
        Ok(())
    }

    async fn render(
        &self,
        request: &AssembledRequest,
        synthesizer: &dyn SpeechSynthesizer,
    ) -> Result<bytes::Bytes, Rejection> {
        synthesis::validate_voice(&request.voice, self.config.allowed_voices.as_deref())?;
        synthesis::validate_speed(request.speed)?;
        let samples = synthesizer
            .synthesize(&request.text, &request.voice, request.speed)
            .await?;
        Ok(self.config.audio_format.encode(&samples)?)
    }
}
