use std::future::Future;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::attestation::types::VerifiedMeasurement;
use crate::attestation::{AttestationVerifier, TransparencyLog};
use crate::error::{Error, ProtocolError, SessionError};
use crate::frame::message::{CancelNotice, RequestId};
use crate::frame::FrameType;
use crate::ratchet::Role;
use crate::stream::StreamCodec;

use super::channel::{Message, SecureChannel};
use super::retry::{with_retry, RetryPolicy};
use super::SessionConfig;

/// Destination for decrypted audio, fed in strict sequence order.
#[async_trait]
pub trait AudioSink: Send {
    async fn write_chunk(&mut self, sequence: u32, audio: Bytes) -> Result<(), Error>;
}

#[async_trait]
impl AudioSink for Vec<u8> {
    async fn write_chunk(&mut self, _sequence: u32, audio: Bytes) -> Result<(), Error> {
        self.extend_from_slice(&audio);
        Ok(())
    }
}

#[async_trait]
impl AudioSink for mpsc::Sender<Bytes> {
    async fn write_chunk(&mut self, _sequence: u32, audio: Bytes) -> Result<(), Error> {
        self.send(audio).await.map_err(|_| SessionError::Closed.into())
    }
}

/// Outcome of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSummary {
    pub request_id: RequestId,
    pub chunks: u32,
    pub audio_bytes: u64,
    /// Epoch the request ran in.
    pub epoch: u32,
    /// Whether the rotation policy advanced the epoch afterwards.
    pub epoch_advanced: bool,
}

/// Client end of an attested session with a speech enclave.
///
/// Carries one request at a time; [`begin_request`](Self::begin_request)
/// borrows the session until the request completes, is cancelled, or fails.
pub struct ClientSession<T> {
    channel: SecureChannel<T>,
    stream: StreamCodec,
    config: SessionConfig,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ClientSession<T> {
    /// Run the handshake over `transport` and verify the enclave against
    /// `log`. Fails with the specific attestation error on rejection.
    pub async fn connect(
        transport: T,
        verifier: &AttestationVerifier,
        log: &dyn TransparencyLog,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let channel = SecureChannel::connect(transport, verifier, log, &config).await?;
        Ok(Self {
            channel,
            stream: StreamCodec::new(Role::Initiator, config.reassembly_limit),
            config,
        })
    }

    /// Like [`connect`](Self::connect), opening a new transport with
    /// `open_transport` for each attempt and retrying transient failures per
    /// `config.retry_policy`.
    pub async fn connect_with_retry<F, Fut>(
        mut open_transport: F,
        verifier: &AttestationVerifier,
        log: &dyn TransparencyLog,
        config: SessionConfig,
    ) -> Result<Self, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let policy = config.retry_policy.clone().unwrap_or_else(RetryPolicy::none);
        with_retry(&policy, || {
            let opening = open_transport();
            let config = config.clone();
            async move {
                let transport = opening.await?;
                Self::connect(transport, verifier, log, config).await
            }
        })
        .await
    }

    pub fn peer(&self) -> Option<&VerifiedMeasurement> {
        self.channel.peer()
    }

    pub fn epoch(&self) -> u32 {
        self.channel.epoch()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Open a new request. Text is supplied with
    /// [`InFlightRequest::send_text`].
    pub fn begin_request(
        &mut self,
        voice: impl Into<String>,
        speed: f32,
    ) -> Result<InFlightRequest<'_, T>, Error> {
        if !self.is_open() {
            return Err(SessionError::Closed.into());
        }
        let request_id = RequestId::random();
        self.stream.begin(request_id)?;
        tracing::debug!(%request_id, epoch = self.epoch(), "request started");
        Ok(InFlightRequest {
            session: self,
            request_id,
            voice: voice.into(),
            speed,
            token: CancellationToken::new(),
            text_finished: false,
            done: false,
        })
    }

    /// Send `text` as a single chunk and collect the whole response.
    pub async fn synthesize(
        &mut self,
        voice: &str,
        speed: f32,
        text: &str,
    ) -> Result<Vec<u8>, Error> {
        let mut request = self.begin_request(voice, speed)?;
        request.send_text(text, true).await?;
        let mut audio = Vec::new();
        request.receive_audio(&mut audio).await?;
        Ok(audio)
    }

    /// Advance to the next epoch outside the rotation policy.
    ///
    /// If the current epoch was never announced to the enclave, a heartbeat
    /// is sent first so the enclave never has to skip an epoch.
    pub async fn rotate_epoch(&mut self) -> Result<u32, Error> {
        if self.channel.last_sent_epoch() != Some(self.channel.epoch()) {
            self.channel.heartbeat().await?;
        }
        let epoch = self.channel.ratchet_mut().advance_epoch()?;
        Ok(epoch)
    }

    pub async fn heartbeat(&mut self) -> Result<(), Error> {
        self.channel.heartbeat().await
    }

    /// Shut the session down and discard its keys.
    pub async fn close(mut self) -> Result<(), Error> {
        self.channel.close().await
    }

    /// Tear the session down at once, discarding its keys.
    pub fn abort(&mut self) {
        self.stream.abandon();
        self.channel.abort();
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal_to_session() {
            self.abort();
        }
        err
    }
}

/// One request in progress on a [`ClientSession`].
///
/// Dropping it before it completes or is cancelled aborts the whole session,
/// since the enclave may still be streaming into the channel.
pub struct InFlightRequest<'s, T: AsyncRead + AsyncWrite + Unpin> {
    session: &'s mut ClientSession<T>,
    request_id: RequestId,
    voice: String,
    speed: f32,
    token: CancellationToken,
    text_finished: bool,
    done: bool,
}

impl<'s, T: AsyncRead + AsyncWrite + Unpin> InFlightRequest<'s, T> {
    pub fn id(&self) -> RequestId {
        self.request_id
    }

    /// Token that cancels this request from another task while
    /// [`receive_audio`](Self::receive_audio) is waiting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Encrypt and send the next text chunk.
    pub async fn send_text(&mut self, text: &str, is_final: bool) -> Result<(), Error> {
        if self.done {
            return Err(SessionError::InvalidState("request finished").into());
        }
        let payload = self
            .session
            .stream
            .encode_request(&self.voice, self.speed, text, is_final)?;
        self.session
            .channel
            .send(FrameType::Request, &payload, is_final)
            .await
            .map_err(|e| self.session.fail(e))?;
        self.text_finished = is_final;
        Ok(())
    }

    /// Receive and decrypt the response, writing audio to `sink` in order.
    ///
    /// Completes once the final chunk arrives, after which the rotation
    /// policy is applied. If the cancellation token fires first, the request
    /// is cancelled and [`SessionError::Cancelled`] is returned with the
    /// session still usable.
    pub async fn receive_audio<S>(&mut self, sink: &mut S) -> Result<ResponseSummary, Error>
    where
        S: AudioSink + ?Sized,
    {
        if self.done || !self.text_finished {
            return Err(SessionError::InvalidState("request text not finalized").into());
        }
        let limit = self.session.config.chunk_timeout;
        let epoch = self.session.epoch();
        let mut chunks = 0u32;
        let mut audio_bytes = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                msg = self.session.channel.recv_chunk(limit) => Some(msg),
            };
            let msg = match next {
                Some(msg) => msg.map_err(|e| self.session.fail(e))?,
                None => {
                    self.cancel_in_place().await?;
                    return Err(SessionError::Cancelled.into());
                }
            };

            match msg {
                Message::Response {
                    payload,
                    final_flag,
                } => {
                    let chunk = self
                        .session
                        .stream
                        .decode_response(&payload)
                        .map_err(|e| self.session.fail(e))?;
                    if chunk.is_final != final_flag {
                        return Err(self.session.fail(
                            ProtocolError::MalformedChunk("final flag disagrees with frame").into(),
                        ));
                    }
                    chunks += 1;
                    audio_bytes += chunk.audio.len() as u64;
                    if let Err(e) = sink.write_chunk(chunk.sequence, chunk.audio).await {
                        self.cancel_in_place().await?;
                        return Err(e);
                    }
                    if chunk.is_final {
                        return self.complete(epoch, chunks, audio_bytes);
                    }
                }
                Message::Error(notice) => {
                    if notice.request_id != self.request_id {
                        return Err(self.session.fail(ProtocolError::RequestIdMismatch.into()));
                    }
                    self.session.stream.abandon();
                    self.done = true;
                    tracing::warn!(request_id = %self.request_id, kind = %notice.kind, "request rejected");
                    return Err(SessionError::Rejected(notice.kind).into());
                }
                Message::Heartbeat => {}
                Message::Shutdown => {
                    return Err(self.session.fail(SessionError::Closed.into()));
                }
                other => {
                    return Err(self.session.fail(
                        SessionError::UnexpectedMessage {
                            expected: "Response",
                            actual: other.name().to_string(),
                        }
                        .into(),
                    ));
                }
            }
        }
    }

    fn complete(
        &mut self,
        epoch: u32,
        chunks: u32,
        audio_bytes: u64,
    ) -> Result<ResponseSummary, Error> {
        let request_id = self
            .session
            .stream
            .finish()
            .map_err(|e| self.session.fail(e))?;
        self.done = true;
        let epoch_advanced = self
            .session
            .channel
            .ratchet_mut()
            .request_completed()
            .map_err(|e| self.session.fail(e.into()))?;
        tracing::debug!(%request_id, chunks, audio_bytes, epoch_advanced, "request completed");
        Ok(ResponseSummary {
            request_id,
            chunks,
            audio_bytes,
            epoch,
            epoch_advanced,
        })
    }

    /// Cancel the request. Partial text or audio is discarded and the epoch
    /// does not advance; the session stays open for the next request.
    pub async fn cancel(mut self) -> Result<(), Error> {
        if self.done {
            return Ok(());
        }
        self.cancel_in_place().await
    }

    async fn cancel_in_place(&mut self) -> Result<(), Error> {
        let limit = self.session.config.chunk_timeout;
        let notice = CancelNotice {
            request_id: self.request_id,
        };
        self.session
            .channel
            .send(FrameType::Cancel, &notice.encode(), true)
            .await
            .map_err(|e| self.session.fail(e))?;

        // Frames already in flight are opened to keep the sequence intact,
        // then dropped.
        loop {
            let msg = self
                .session
                .channel
                .recv_chunk(limit)
                .await
                .map_err(|e| self.session.fail(e))?;
            match msg {
                Message::Cancel(echo) if echo.request_id == self.request_id => break,
                Message::Cancel(_) => {
                    return Err(self.session.fail(ProtocolError::RequestIdMismatch.into()));
                }
                Message::Response { .. } | Message::Error(_) | Message::Heartbeat => {}
                Message::Shutdown => return Err(self.session.fail(SessionError::Closed.into())),
                Message::Request { .. } => {
                    return Err(self.session.fail(
                        SessionError::UnexpectedMessage {
                            expected: "Cancel",
                            actual: "Request".to_string(),
                        }
                        .into(),
                    ));
                }
            }
        }

        self.session.stream.abandon();
        self.done = true;
        tracing::debug!(request_id = %self.request_id, "request cancelled");
        Ok(())
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Drop for InFlightRequest<'_, T> {
    fn drop(&mut self) {
        if !self.done && self.session.is_open() {
            tracing::warn!(request_id = %self.request_id, "request dropped unfinished, aborting session");
            self.session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::mock::MockPlatform;
    use crate::billing::InMemoryBillingLedger;
    use crate::error::{AttestError, ErrorKind};
    use crate::session::enclave::EnclaveSession;
    use crate::session::EnclaveConfig;
    use crate::synthesis::ToneSynthesizer;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    async fn connected() -> (
        ClientSession<DuplexStream>,
        tokio::task::JoinHandle<Result<crate::session::enclave::ServeSummary, Error>>,
        Arc<InMemoryBillingLedger>,
    ) {
        let platform = MockPlatform::new([0x44; 32]);
        let log = platform.approved_log();
        let verifier = platform.verifier();
        let ledger = Arc::new(InMemoryBillingLedger::new());
        let (a, b) = tokio::io::duplex(64 * 1024);

        let billing = ledger.clone();
        let server = tokio::spawn(async move {
            let enclave = EnclaveSession::accept(b, &platform, EnclaveConfig::default()).await?;
            enclave.serve(&ToneSynthesizer::new(), billing.as_ref()).await
        });
        let client = ClientSession::connect(a, &verifier, &log, SessionConfig::default())
            .await
            .unwrap();
        (client, server, ledger)
    }

    #[tokio::test]
    async fn synthesize_returns_wav() {
        let (mut client, server, ledger) = connected().await;
        let audio = client.synthesize("af_bella", 1.0, "Hello").await.unwrap();
        assert_eq!(&audio[..4], b"RIFF");
        assert_eq!(client.epoch(), 1);

        client.close().await.unwrap();
        let summary = server.await.unwrap().unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(ledger.total_characters(), 5);
    }

    #[tokio::test]
    async fn receive_before_final_text_refused() {
        let (mut client, _server, _) = connected().await;
        let mut request = client.begin_request("af_bella", 1.0).unwrap();
        request.send_text("Hel", false).await.unwrap();
        let err = request.receive_audio(&mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::InvalidState(_))));
        request.cancel().await.unwrap();
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn dropping_unfinished_request_aborts_session() {
        let (mut client, _server, _) = connected().await;
        {
            let mut request = client.begin_request("af_bella", 1.0).unwrap();
            request.send_text("Hello", true).await.unwrap();
        }
        assert!(!client.is_open());
        let err = client.begin_request("af_bella", 1.0).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn token_cancels_waiting_request() {
        let (mut client, _server, ledger) = connected().await;
        let mut request = client.begin_request("af_bella", 1.0).unwrap();
        request.send_text("Hello", true).await.unwrap();
        request.cancellation_token().cancel();
        let err = request.receive_audio(&mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        drop(request);

        assert!(client.is_open());
        assert_eq!(client.epoch(), 0);
        // The enclave finished the request before it read the cancel, so it
        // billed and still echoed.
        assert_eq!(ledger.records().len(), 1);
        let audio = client.synthesize("af_bella", 1.0, "Hi").await.unwrap();
        assert!(!audio.is_empty());
    }

    #[tokio::test]
    async fn manual_rotation_announces_pending_epoch() {
        let (mut client, _server, _) = connected().await;
        client.synthesize("af_sky", 1.0, "one").await.unwrap();
        assert_eq!(client.epoch(), 1);
        // Epoch 1 was never announced; rotating again must not skip it.
        assert_eq!(client.rotate_epoch().await.unwrap(), 2);
        client.synthesize("af_sky", 1.0, "two").await.unwrap();
        assert_eq!(client.epoch(), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_attestation_failure() {
        let platform = MockPlatform::new([0x45; 32]);
        let verifier = platform.verifier();
        let empty = crate::attestation::log::InMemoryTransparencyLog::new();
        let config = SessionConfig::builder()
            .retry_policy(RetryPolicy {
                max_retries: 3,
                initial_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(1),
                backoff_multiplier: 1.0,
            })
            .build()
            .unwrap();

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = ClientSession::connect_with_retry(
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let (a, b) = tokio::io::duplex(64 * 1024);
                let platform = platform.clone();
                tokio::spawn(async move {
                    let _ = EnclaveSession::accept(b, &platform, EnclaveConfig::default()).await;
                });
                async move { Ok::<_, io::Error>(a) }
            },
            &verifier,
            &empty,
            config,
        )
        .await;

        assert!(matches!(
            result.err().unwrap(),
            Error::Attestation(AttestError::UnknownOrRevokedMeasurement)
        ));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
