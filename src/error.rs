use std::io;

/// Errors from frame parsing and encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid magic bytes: expected 0x7453, got 0x{0:04X}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("HKDF expand failed: invalid length")]
    HkdfExpandFailed,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("nonce overflow: maximum sequence number reached")]
    NonceOverflow,

    #[error("epoch {requested} is not the current epoch ({current})")]
    EpochRetired { requested: u32, current: u32 },

    #[error("ratchet key material has been discarded")]
    Discarded,

    #[error("non-contributory key exchange: peer sent small-subgroup or identity point")]
    NonContributoryKey,
}

/// Errors from attestation verification. All of them abort the handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestError {
    #[error("attestation signature chain is invalid")]
    InvalidSignature,

    #[error("attestation nonce is stale or does not match the challenge")]
    ExpiredOrMismatchedNonce,

    #[error("measurement is unknown to the transparency log or revoked")]
    UnknownOrRevokedMeasurement,

    #[error("key package has expired")]
    KeyPackageExpired,

    #[error("malformed attestation material: {0}")]
    Malformed(&'static str),

    #[error("attestation generation failed: {0}")]
    GenerationFailed(String),
}

/// Structural and sequencing violations. Fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("out-of-order sequence: expected {expected}, got {received}")]
    OutOfOrderSequence { expected: u32, received: u32 },

    #[error("duplicate sequence: expected {expected}, got {received}")]
    DuplicateSequence { expected: u32, received: u32 },

    #[error("malformed chunk: {0}")]
    MalformedChunk(&'static str),

    #[error("request id does not match the in-flight request")]
    RequestIdMismatch,

    #[error("unexpected epoch {received} (current {current})")]
    EpochMismatch { current: u32, received: u32 },
}

/// Errors from session establishment and communication.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timed out waiting for the next chunk")]
    ChunkTimeout,

    #[error("handshake phase timed out")]
    HandshakeTimeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("enclave rejected request: {0}")]
    Rejected(String),

    #[error("session closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Resource limits exceeded by a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("reassembly buffer exceeded: {size} bytes (limit {limit})")]
    ReassemblyBufferExceeded { size: usize, limit: usize },
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Attestation(#[from] AttestError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Data-free classification of an [`Error`], safe to surface to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidSignature,
    ExpiredOrMismatchedNonce,
    UnknownOrRevokedMeasurement,
    KeyPackageExpired,
    MalformedAttestation,
    OutOfOrderSequence,
    DuplicateSequence,
    MalformedChunk,
    RequestIdMismatch,
    EpochMismatch,
    ChunkTimeout,
    HandshakeTimeout,
    Cancelled,
    Rejected,
    /// A well-formed frame arrived that the session does not accept here.
    UnexpectedMessage,
    /// The local API was used out of order.
    InvalidState,
    ReassemblyBufferExceeded,
    Crypto,
    Handshake,
    Closed,
    Config,
    Transport,
}

impl Error {
    /// Classify the error without exposing any of its payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Attestation(e) => match e {
                AttestError::InvalidSignature => ErrorKind::InvalidSignature,
                AttestError::ExpiredOrMismatchedNonce => ErrorKind::ExpiredOrMismatchedNonce,
                AttestError::UnknownOrRevokedMeasurement => {
                    ErrorKind::UnknownOrRevokedMeasurement
                }
                AttestError::KeyPackageExpired => ErrorKind::KeyPackageExpired,
                AttestError::Malformed(_) | AttestError::GenerationFailed(_) => {
                    ErrorKind::MalformedAttestation
                }
            },
            Error::Protocol(e) => match e {
                ProtocolError::OutOfOrderSequence { .. } => ErrorKind::OutOfOrderSequence,
                ProtocolError::DuplicateSequence { .. } => ErrorKind::DuplicateSequence,
                ProtocolError::MalformedChunk(_) => ErrorKind::MalformedChunk,
                ProtocolError::RequestIdMismatch => ErrorKind::RequestIdMismatch,
                ProtocolError::EpochMismatch { .. } => ErrorKind::EpochMismatch,
            },
            Error::Session(e) => match e {
                SessionError::ChunkTimeout => ErrorKind::ChunkTimeout,
                SessionError::HandshakeTimeout => ErrorKind::HandshakeTimeout,
                SessionError::Cancelled => ErrorKind::Cancelled,
                SessionError::Rejected(_) => ErrorKind::Rejected,
                SessionError::Closed => ErrorKind::Closed,
                SessionError::InvalidConfig(_) => ErrorKind::Config,
                SessionError::HandshakeFailed(_) => ErrorKind::Handshake,
                SessionError::UnexpectedMessage { .. } => ErrorKind::UnexpectedMessage,
                SessionError::InvalidState(_) => ErrorKind::InvalidState,
            },
            Error::Resource(ResourceError::ReassemblyBufferExceeded { .. }) => {
                ErrorKind::ReassemblyBufferExceeded
            }
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Frame(FrameError::Io(_)) | Error::Io(_) => ErrorKind::Transport,
            Error::Frame(_) => ErrorKind::MalformedChunk,
        }
    }

    /// Whether a caller may retry with a brand-new connection and handshake.
    ///
    /// Attestation, protocol, and cryptographic failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Session(
                SessionError::ChunkTimeout
                    | SessionError::HandshakeTimeout
                    | SessionError::Cancelled
                    | SessionError::Closed
            ) | Error::Io(_)
                | Error::Frame(FrameError::Io(_))
        )
    }

    /// Whether the error tears down the session it occurred on.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(
            self,
            Error::Session(SessionError::Cancelled | SessionError::Rejected(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
