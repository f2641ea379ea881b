//! Attestation-gated key exchange.
//!
//! ```text
//! client                                    enclave
//!   | Hello seq 0: ClientChallenge{nonce}      |
//!   |----------------------------------------->|  quote(nonce, binding_pk)
//!   | Hello seq 0: AttestationResponse         |
//!   |<-----------------------------------------|
//!   | verify quote, binding, key package       |
//!   | Hello seq 1: KeyExchange{pk, confirm}    |
//!   |----------------------------------------->|  derive root, check confirm
//! ```
//!
//! Both sides end with an epoch-0 [`GroupRatchet`]. A dropped connection
//! always requires a new handshake with a new nonce and a fresh quote.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::attestation::types::{
    AttestationQuote, BindingSignature, KeyPackage, VerifiedMeasurement,
};
use crate::attestation::{AttestationProvider, AttestationVerifier, TransparencyLog};
use crate::crypto::kex::{self, KeyPair};
use crate::crypto::transcript::compute_transcript;
use crate::error::{AttestError, Error, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::message::{AttestationResponse, ClientChallenge, KeyExchange};
use crate::frame::{Frame, FrameType};
use crate::ratchet::{GroupRatchet, Role, RotationPolicy};

use super::{EnclaveConfig, SessionConfig};

/// Largest handshake frame payload accepted. Handshake messages are a few
/// hundred bytes.
const MAX_HANDSHAKE_PAYLOAD: u32 = 64 * 1024;

/// Progress of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitingAttestation,
    Verifying,
    Committing,
    Established,
    /// Terminal; reached from any other state on failure.
    Aborted,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::AwaitingAttestation => "AwaitingAttestation",
            Self::Verifying => "Verifying",
            Self::Committing => "Committing",
            Self::Established => "Established",
            Self::Aborted => "Aborted",
        }
    }
}

fn validate_hello(frame: &Frame, expected_seq: u32) -> Result<(), Error> {
    if frame.header.msg_type != FrameType::Hello {
        return Err(SessionError::HandshakeFailed(format!(
            "expected Hello, got {:?}",
            frame.header.msg_type
        ))
        .into());
    }
    if frame.header.flags.is_encrypted() || frame.header.epoch != 0 {
        return Err(SessionError::HandshakeFailed("malformed hello header".into()).into());
    }
    if frame.header.sequence != expected_seq {
        return Err(SessionError::HandshakeFailed(format!(
            "unexpected handshake sequence: expected {expected_seq}, got {}",
            frame.header.sequence
        ))
        .into());
    }
    Ok(())
}

/// Attestation material received from the enclave, parsed but not yet trusted.
struct ReceivedAttestation {
    quote: AttestationQuote,
    key_package_raw: bytes::Bytes,
    key_package: KeyPackage,
    binding: BindingSignature,
}

/// Client side of the handshake.
///
/// `Init → AwaitingAttestation → Verifying → Committing → Established`;
/// any failure or out-of-order call moves it to `Aborted`.
pub struct ClientHandshake {
    state: HandshakeState,
    nonce: [u8; 32],
    received: Option<ReceivedAttestation>,
    verified: Option<VerifiedMeasurement>,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    /// Start an attempt with a fresh random challenge nonce.
    pub fn new() -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        Self::with_nonce(nonce)
    }

    /// Start an attempt with a caller-chosen nonce.
    pub fn with_nonce(nonce: [u8; 32]) -> Self {
        Self {
            state: HandshakeState::Init,
            nonce,
            received: None,
            verified: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn nonce(&self) -> &[u8; 32] {
        &self.nonce
    }

    /// The verified measurement, once `Verifying` has succeeded.
    pub fn verified(&self) -> Option<&VerifiedMeasurement> {
        self.verified.as_ref()
    }

    pub fn abort(&mut self) {
        self.state = HandshakeState::Aborted;
        self.received = None;
    }

    fn expect(&mut self, state: HandshakeState) -> Result<(), Error> {
        if self.state == state {
            return Ok(());
        }
        let from = self.state.name();
        self.abort();
        Err(SessionError::InvalidState(from).into())
    }

    fn settle<T>(&mut self, result: Result<T, Error>, next: HandshakeState) -> Result<T, Error> {
        match result {
            Ok(v) => {
                self.state = next;
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(state = self.state.name(), kind = ?e.kind(), "handshake aborted");
                self.abort();
                Err(e)
            }
        }
    }

    /// `Init → AwaitingAttestation`: produce the challenge frame.
    pub fn challenge(&mut self) -> Result<Frame, Error> {
        self.expect(HandshakeState::Init)?;
        let frame = Frame::hello(0, ClientChallenge { nonce: self.nonce }.encode());
        self.settle(Ok(frame), HandshakeState::AwaitingAttestation)
    }

    /// `AwaitingAttestation → Verifying`: accept the enclave's reply.
    pub fn receive_attestation(&mut self, frame: &Frame) -> Result<(), Error> {
        self.expect(HandshakeState::AwaitingAttestation)?;
        let result = Self::parse_attestation(frame).map(|received| {
            self.received = Some(received);
        });
        self.settle(result, HandshakeState::Verifying)
    }

    fn parse_attestation(frame: &Frame) -> Result<ReceivedAttestation, Error> {
        validate_hello(frame, 0)?;
        let response = AttestationResponse::decode(&frame.payload)?;
        Ok(ReceivedAttestation {
            quote: AttestationQuote::parse(&response.quote)?,
            key_package: KeyPackage::decode(&response.key_package)?,
            key_package_raw: response.key_package,
            binding: BindingSignature::from_slice(&response.binding_signature)?,
        })
    }

    /// `Verifying → Committing`: check the quote against the hardware roots
    /// and `log`, then the binding signature and key package expiry.
    pub async fn verify(
        &mut self,
        verifier: &AttestationVerifier,
        log: &dyn TransparencyLog,
    ) -> Result<VerifiedMeasurement, Error> {
        self.expect(HandshakeState::Verifying)?;
        let result = self.check_attestation(verifier, log).await;
        if let Ok(verified) = &result {
            self.verified = Some(verified.clone());
        }
        self.settle(result, HandshakeState::Committing)
    }

    async fn check_attestation(
        &self,
        verifier: &AttestationVerifier,
        log: &dyn TransparencyLog,
    ) -> Result<VerifiedMeasurement, Error> {
        let received = self
            .received
            .as_ref()
            .ok_or(SessionError::InvalidState("Verifying"))?;

        let verified = verifier.verify(&received.quote, &self.nonce, log).await?;
        received.binding.verify(
            &verified.binding_key,
            received.quote.as_bytes(),
            &received.key_package_raw,
        )?;
        if received.key_package.is_expired() {
            return Err(AttestError::KeyPackageExpired.into());
        }
        Ok(verified)
    }

    /// `Committing → Established`: generate the client key share, derive the
    /// epoch-0 ratchet, and produce the key-exchange frame.
    pub fn commit(&mut self, policy: RotationPolicy) -> Result<(Frame, GroupRatchet), Error> {
        self.expect(HandshakeState::Committing)?;
        let result = self.derive(policy);
        // The key package is single use.
        self.received = None;
        self.settle(result, HandshakeState::Established)
    }

    fn derive(&self, policy: RotationPolicy) -> Result<(Frame, GroupRatchet), Error> {
        let received = self
            .received
            .as_ref()
            .ok_or(SessionError::InvalidState("Committing"))?;

        let keypair = KeyPair::generate();
        let client_public = keypair.public.to_bytes();
        let transcript = compute_transcript(
            &self.nonce,
            received.quote.as_bytes(),
            &received.key_package_raw,
            &client_public,
        );
        let enclave_public = PublicKey::from(received.key_package.public_key);
        let root = kex::derive_root_secret(&keypair.secret, &enclave_public, &transcript)?;
        let session_id = kex::derive_session_id(&transcript)?;
        let ratchet = GroupRatchet::new(Role::Initiator, session_id, &root, policy)?;

        let exchange = KeyExchange {
            client_public,
            confirmation: ratchet.confirmation()?,
        };
        Ok((Frame::hello(1, exchange.encode()), ratchet))
    }
}

/// Key material the enclave holds between its reply and the client's share.
struct PendingExchange {
    nonce: [u8; 32],
    quote: bytes::Bytes,
    key_package_raw: bytes::Bytes,
    key_package: KeyPackage,
    secret: StaticSecret,
}

/// Enclave side of the handshake: `Init → Committing → Established`.
pub struct EnclaveHandshake {
    state: HandshakeState,
    key_package_ttl: Duration,
    pending: Option<PendingExchange>,
}

impl EnclaveHandshake {
    pub fn new(key_package_ttl: Duration) -> Self {
        Self {
            state: HandshakeState::Init,
            key_package_ttl,
            pending: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn abort(&mut self) {
        self.state = HandshakeState::Aborted;
        self.pending = None;
    }

    fn expect(&mut self, state: HandshakeState) -> Result<(), Error> {
        if self.state == state {
            return Ok(());
        }
        let from = self.state.name();
        self.abort();
        Err(SessionError::InvalidState(from).into())
    }

    fn settle<T>(&mut self, result: Result<T, Error>, next: HandshakeState) -> Result<T, Error> {
        match result {
            Ok(v) => {
                self.state = next;
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(state = self.state.name(), kind = ?e.kind(), "handshake aborted");
                self.abort();
                Err(e)
            }
        }
    }

    /// `Init → Committing`: answer the client's challenge with a quote bound
    /// to a one-time binding key and a fresh key package.
    pub async fn answer_challenge(
        &mut self,
        frame: &Frame,
        provider: &dyn AttestationProvider,
    ) -> Result<Frame, Error> {
        self.expect(HandshakeState::Init)?;
        let result = self.attest(frame, provider).await;
        let result = result.map(|(reply, pending)| {
            self.pending = Some(pending);
            reply
        });
        self.settle(result, HandshakeState::Committing)
    }

    async fn attest(
        &self,
        frame: &Frame,
        provider: &dyn AttestationProvider,
    ) -> Result<(Frame, PendingExchange), Error> {
        validate_hello(frame, 0)?;
        let challenge = ClientChallenge::decode(&frame.payload)?;

        let binding_key = SigningKey::generate(&mut OsRng);
        let keypair = KeyPair::generate();
        let key_package = KeyPackage::new(keypair.public.to_bytes(), self.key_package_ttl);
        let key_package_raw = key_package.encode();

        let quote = provider
            .quote(&challenge.nonce, &binding_key.verifying_key().to_bytes())
            .await?;
        let quote_raw = bytes::Bytes::copy_from_slice(quote.as_bytes());
        let binding = BindingSignature::sign(&binding_key, &quote_raw, &key_package_raw);
        tracing::debug!(quote_len = quote_raw.len(), "attestation quote generated");

        let reply = AttestationResponse {
            quote: quote_raw.clone(),
            key_package: key_package_raw.clone(),
            binding_signature: bytes::Bytes::copy_from_slice(&binding.0),
        };
        Ok((
            Frame::hello(0, reply.encode()),
            PendingExchange {
                nonce: challenge.nonce,
                quote: quote_raw,
                key_package_raw,
                key_package,
                secret: keypair.secret,
            },
        ))
    }

    /// `Committing → Established`: complete the exchange with the client's
    /// key share and check its key confirmation.
    pub fn complete(&mut self, frame: &Frame) -> Result<GroupRatchet, Error> {
        self.expect(HandshakeState::Committing)?;
        let result = match self.pending.take() {
            Some(pending) => Self::derive(frame, pending),
            None => Err(SessionError::InvalidState("Committing").into()),
        };
        self.settle(result, HandshakeState::Established)
    }

    fn derive(frame: &Frame, pending: PendingExchange) -> Result<GroupRatchet, Error> {
        validate_hello(frame, 1)?;
        let exchange = KeyExchange::decode(&frame.payload)?;
        if pending.key_package.is_expired() {
            return Err(AttestError::KeyPackageExpired.into());
        }

        let transcript = compute_transcript(
            &pending.nonce,
            &pending.quote,
            &pending.key_package_raw,
            &exchange.client_public,
        );
        let client_public = PublicKey::from(exchange.client_public);
        let root = kex::derive_root_secret(&pending.secret, &client_public, &transcript)?;
        let session_id = kex::derive_session_id(&transcript)?;
        // The responder never rotates on its own; the policy is unused.
        let ratchet = GroupRatchet::new(
            Role::Responder,
            session_id,
            &root,
            RotationPolicy::Manual,
        )?;

        if ratchet.confirmation()? != exchange.confirmation {
            return Err(SessionError::HandshakeFailed(
                "key confirmation mismatch: peer derived different keys".into(),
            )
            .into());
        }
        Ok(ratchet)
    }
}

/// Outcome of a completed handshake.
pub struct Established {
    pub ratchet: GroupRatchet,
    /// The enclave's verified measurement (client side only).
    pub peer: Option<VerifiedMeasurement>,
    /// Bytes read past the last handshake frame; they belong to the channel.
    pub residual: BytesMut,
}

// -- Transport helpers --

async fn phase<F, T>(limit: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SessionError::HandshakeTimeout)?
}

async fn send_frame<T: AsyncWrite + Unpin>(transport: &mut T, frame: Frame) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    FrameCodec::with_max_payload_size(MAX_HANDSHAKE_PAYLOAD).encode(frame, &mut buf)?;
    transport.write_all(&buf).await?;
    transport.flush().await?;
    Ok(())
}

async fn recv_frame<T: AsyncRead + Unpin>(
    transport: &mut T,
    read_buf: &mut BytesMut,
) -> Result<Frame, Error> {
    let mut codec = FrameCodec::with_max_payload_size(MAX_HANDSHAKE_PAYLOAD);
    loop {
        if let Some(frame) = codec.decode(read_buf)? {
            return Ok(frame);
        }
        if transport.read_buf(read_buf).await? == 0 {
            return Err(SessionError::Closed.into());
        }
    }
}

/// Run the client side over `transport`.
///
/// Each receive and the verification step are bounded by
/// `config.handshake_timeout`. Attestation failures surface as the specific
/// [`AttestError`]; no key share is sent after a failed verification.
pub async fn initiate<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    verifier: &AttestationVerifier,
    log: &dyn TransparencyLog,
    config: &SessionConfig,
) -> Result<Established, Error> {
    let mut hs = ClientHandshake::new();
    let result = drive_client(&mut hs, transport, verifier, log, config).await;
    if result.is_err() {
        hs.abort();
    }
    result
}

async fn drive_client<T: AsyncRead + AsyncWrite + Unpin>(
    hs: &mut ClientHandshake,
    transport: &mut T,
    verifier: &AttestationVerifier,
    log: &dyn TransparencyLog,
    config: &SessionConfig,
) -> Result<Established, Error> {
    let limit = config.handshake_timeout;

    send_frame(transport, hs.challenge()?).await?;

    let mut read_buf = BytesMut::with_capacity(4096);
    let reply = phase(limit, recv_frame(transport, &mut read_buf)).await?;
    hs.receive_attestation(&reply)?;

    let verified = phase(limit, hs.verify(verifier, log)).await?;

    let (exchange, ratchet) = hs.commit(config.rotation_policy)?;
    send_frame(transport, exchange).await?;

    tracing::info!(
        version = %verified.version,
        commit = %verified.commit,
        "secure channel established"
    );
    Ok(Established {
        ratchet,
        peer: Some(verified),
        residual: read_buf,
    })
}

/// Run the enclave side over `transport`.
///
/// Waiting for the challenge, generating the quote, and waiting for the key
/// share are each bounded by `config.handshake_timeout`.
pub async fn respond<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    provider: &dyn AttestationProvider,
    config: &EnclaveConfig,
) -> Result<Established, Error> {
    let mut hs = EnclaveHandshake::new(config.key_package_ttl);
    let result = drive_enclave(&mut hs, transport, provider, config).await;
    if result.is_err() {
        hs.abort();
    }
    result
}

async fn drive_enclave<T: AsyncRead + AsyncWrite + Unpin>(
    hs: &mut EnclaveHandshake,
    transport: &mut T,
    provider: &dyn AttestationProvider,
    config: &EnclaveConfig,
) -> Result<Established, Error> {
    let limit = config.handshake_timeout;
    let mut read_buf = BytesMut::with_capacity(4096);

    let challenge = phase(limit, recv_frame(transport, &mut read_buf)).await?;
    let reply = phase(limit, hs.answer_challenge(&challenge, provider)).await?;
    send_frame(transport, reply).await?;

    let exchange = phase(limit, recv_frame(transport, &mut read_buf)).await?;
    let ratchet = hs.complete(&exchange)?;

    tracing::info!("secure channel accepted");
    Ok(Established {
        ratchet,
        peer: None,
        residual: read_buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::log::InMemoryTransparencyLog;
    use crate::attestation::mock::MockPlatform;
    use crate::error::ProtocolError;

    const MEASUREMENT: [u8; 32] = [0x42; 32];

    fn platform() -> (MockPlatform, InMemoryTransparencyLog) {
        let platform = MockPlatform::new(MEASUREMENT);
        let log = platform.approved_log();
        (platform, log)
    }

    async fn run_to_committing(
        platform: &MockPlatform,
        log: &InMemoryTransparencyLog,
    ) -> (ClientHandshake, EnclaveHandshake) {
        let mut client = ClientHandshake::new();
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));
        let challenge = client.challenge().unwrap();
        let reply = enclave.answer_challenge(&challenge, platform).await.unwrap();
        client.receive_attestation(&reply).unwrap();
        client.verify(&platform.verifier(), log).await.unwrap();
        (client, enclave)
    }

    #[tokio::test]
    async fn state_machines_reach_established() {
        let (platform, log) = platform();
        let (mut client, mut enclave) = run_to_committing(&platform, &log).await;
        assert_eq!(client.state(), HandshakeState::Committing);
        assert_eq!(enclave.state(), HandshakeState::Committing);

        let (exchange, mut client_ratchet) = client.commit(RotationPolicy::default()).unwrap();
        let mut enclave_ratchet = enclave.complete(&exchange).unwrap();
        assert_eq!(client.state(), HandshakeState::Established);
        assert_eq!(enclave.state(), HandshakeState::Established);
        assert_eq!(client_ratchet.epoch(), 0);
        assert_eq!(client_ratchet.session_id(), enclave_ratchet.session_id());

        let frame = client_ratchet
            .seal(FrameType::Request, crate::frame::Flags::empty(), b"ping")
            .unwrap();
        assert_eq!(&enclave_ratchet.open(&frame).unwrap()[..], b"ping");
    }

    #[tokio::test]
    async fn unknown_measurement_aborts_before_key_exchange() {
        let (platform, _) = platform();
        let empty = InMemoryTransparencyLog::new();
        let mut client = ClientHandshake::new();
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));

        let reply = enclave
            .answer_challenge(&client.challenge().unwrap(), &platform)
            .await
            .unwrap();
        client.receive_attestation(&reply).unwrap();
        let err = client.verify(&platform.verifier(), &empty).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Attestation(AttestError::UnknownOrRevokedMeasurement)
        ));
        assert_eq!(client.state(), HandshakeState::Aborted);
        assert!(client.commit(RotationPolicy::default()).is_err());
    }

    #[tokio::test]
    async fn swapped_key_package_fails_binding() {
        let (platform, log) = platform();
        let mut client = ClientHandshake::new();
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));
        let reply = enclave
            .answer_challenge(&client.challenge().unwrap(), &platform)
            .await
            .unwrap();

        let mut response = AttestationResponse::decode(&reply.payload).unwrap();
        let forged = KeyPackage::new([0x77; 32], Duration::from_secs(60));
        response.key_package = forged.encode();
        let tampered = Frame::hello(0, response.encode());

        client.receive_attestation(&tampered).unwrap();
        let err = client.verify(&platform.verifier(), &log).await.unwrap_err();
        assert!(matches!(err, Error::Attestation(AttestError::InvalidSignature)));
    }

    #[tokio::test]
    async fn replayed_quote_fails_nonce_check() {
        let (platform, log) = platform();
        let mut first = ClientHandshake::new();
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));
        let old_reply = enclave
            .answer_challenge(&first.challenge().unwrap(), &platform)
            .await
            .unwrap();

        let mut second = ClientHandshake::new();
        second.challenge().unwrap();
        second.receive_attestation(&old_reply).unwrap();
        let err = second.verify(&platform.verifier(), &log).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Attestation(AttestError::ExpiredOrMismatchedNonce)
        ));
    }

    #[tokio::test]
    async fn wrong_confirmation_rejected() {
        let (platform, log) = platform();
        let (mut client, mut enclave) = run_to_committing(&platform, &log).await;
        let (exchange, _) = client.commit(RotationPolicy::default()).unwrap();

        let mut msg = KeyExchange::decode(&exchange.payload).unwrap();
        msg.confirmation[0] ^= 1;
        let err = enclave.complete(&Frame::hello(1, msg.encode())).unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::HandshakeFailed(_))));
        assert_eq!(enclave.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn out_of_order_call_aborts() {
        let mut client = ClientHandshake::new();
        let err = client.commit(RotationPolicy::default()).unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::InvalidState("Init"))));
        assert_eq!(client.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn malformed_challenge_rejected() {
        let (platform, _) = platform();
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));
        let bad = Frame::hello(0, bytes::Bytes::from_static(b"short"));
        let err = enclave.answer_challenge(&bad, &platform).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::MalformedChunk(_))));
    }

    #[tokio::test]
    async fn quote_generation_failure_aborts() {
        let mut enclave = EnclaveHandshake::new(Duration::from_secs(60));
        let challenge = ClientHandshake::new().challenge().unwrap();
        let err = enclave
            .answer_challenge(&challenge, &crate::attestation::mock::FailingProvider)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Attestation(AttestError::GenerationFailed(_))
        ));
        assert_eq!(enclave.state(), HandshakeState::Aborted);
    }

    #[tokio::test]
    async fn drivers_complete_over_duplex() {
        let (platform, log) = platform();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let verifier = platform.verifier();

        let enclave_config = EnclaveConfig::default();
        let client_config = SessionConfig::default();
        let (client, enclave) = tokio::join!(
            initiate(&mut a, &verifier, &log, &client_config),
            respond(&mut b, &platform, &enclave_config),
        );
        let client = client.unwrap();
        let enclave = enclave.unwrap();
        assert_eq!(client.ratchet.session_id(), enclave.ratchet.session_id());
        assert_eq!(client.peer.unwrap().measurement, MEASUREMENT);
        assert!(enclave.peer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_enclave_times_out() {
        let (platform, log) = platform();
        let (mut a, _b) = tokio::io::duplex(4096);
        let config = SessionConfig::builder()
            .handshake_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let err = initiate(&mut a, &platform.verifier(), &log, &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Session(SessionError::HandshakeTimeout)));
    }
}
