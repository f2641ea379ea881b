pub mod channel;
pub mod client;
pub mod enclave;
pub mod handshake;
pub mod retry;

use std::time::Duration;

use crate::billing::BillingMode;
use crate::error::{Error, SessionError};
use crate::ratchet::RotationPolicy;
use crate::stream::{DEFAULT_REASSEMBLY_LIMIT, DEFAULT_RESPONSE_LIMIT};
use crate::synthesis::AudioFormat;

use self::retry::RetryPolicy;

/// Default per-phase handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long a peer may delay the next expected chunk.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of an enclave key package.
pub const DEFAULT_KEY_PACKAGE_TTL: Duration = Duration::from_secs(300);

/// Default size of one response audio chunk (16 KiB).
pub const DEFAULT_RESPONSE_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes a response chunk adds around its audio: request id, sequence,
/// length prefix, final marker, AEAD tag.
const RESPONSE_OVERHEAD: usize = 16 + 4 + 4 + 1 + 16;

fn invalid(reason: &'static str) -> Error {
    SessionError::InvalidConfig(reason).into()
}

fn validate_common(
    max_payload_size: u32,
    handshake_timeout: Duration,
    chunk_timeout: Duration,
    idle_timeout: Option<Duration>,
    reassembly_limit: usize,
) -> Result<(), Error> {
    if max_payload_size == 0 || max_payload_size > crate::frame::MAX_PAYLOAD_SIZE {
        return Err(invalid("max_payload_size must be within 1..=16 MiB"));
    }
    if handshake_timeout.is_zero() {
        return Err(invalid("handshake_timeout must be > 0"));
    }
    if chunk_timeout.is_zero() {
        return Err(invalid("chunk_timeout must be > 0"));
    }
    if idle_timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid("idle_timeout must be > 0"));
    }
    if reassembly_limit == 0 {
        return Err(invalid("reassembly_limit must be > 0"));
    }
    Ok(())
}

/// Client-side session configuration.
///
/// The cipher suite is always X25519 + HKDF-SHA256 + ChaCha20-Poly1305.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum frame payload in bytes (default: 16 MiB).
    pub max_payload_size: u32,

    /// Bound on each handshake phase (default: 30s).
    pub handshake_timeout: Duration,

    /// Bound on the wait for the next chunk of an in-flight request (default: 30s).
    pub chunk_timeout: Duration,

    /// Epoch rotation cadence (default: every request).
    pub rotation_policy: RotationPolicy,

    /// Ceiling on audio bytes received per request; exceeding it tears the
    /// session down (default: 64 MiB).
    pub reassembly_limit: usize,

    /// Optional reconnect policy for [`client::ClientSession::connect_with_retry`].
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            rotation_policy: RotationPolicy::default(),
            reassembly_limit: DEFAULT_RESPONSE_LIMIT,
            retry_policy: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn chunk_timeout(mut self, timeout: Duration) -> Self {
        self.config.chunk_timeout = timeout;
        self
    }

    pub fn rotation_policy(mut self, policy: RotationPolicy) -> Self {
        self.config.rotation_policy = policy;
        self
    }

    pub fn reassembly_limit(mut self, limit: usize) -> Self {
        self.config.reassembly_limit = limit;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Build the `SessionConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<SessionConfig, Error> {
        let c = &self.config;
        validate_common(
            c.max_payload_size,
            c.handshake_timeout,
            c.chunk_timeout,
            None,
            c.reassembly_limit,
        )?;
        match c.rotation_policy {
            RotationPolicy::EveryNRequests(0) => {
                return Err(invalid("rotation every 0 requests"));
            }
            RotationPolicy::Interval(period) if period.is_zero() => {
                return Err(invalid("rotation interval must be > 0"));
            }
            _ => {}
        }
        Ok(self.config)
    }
}

/// Enclave-side session configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Maximum frame payload in bytes (default: 16 MiB).
    pub max_payload_size: u32,

    /// Bound on each handshake phase, quote generation included (default: 30s).
    pub handshake_timeout: Duration,

    /// Bound on the wait for the next chunk of an in-flight request (default: 30s).
    pub chunk_timeout: Duration,

    /// Bound on the wait for a new request while idle (default: none).
    pub idle_timeout: Option<Duration>,

    /// Ceiling on buffered request text (default: 1 MiB).
    pub reassembly_limit: usize,

    /// Lifetime of the key package offered in the handshake (default: 300s).
    pub key_package_ttl: Duration,

    /// Largest audio slice per response chunk (default: 16 KiB).
    pub response_chunk_size: usize,

    pub audio_format: AudioFormat,

    pub billing_mode: BillingMode,

    /// Voices accepted in requests; `None` accepts any well-formed id and
    /// leaves availability to the synthesizer.
    pub allowed_voices: Option<Vec<String>>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            idle_timeout: None,
            reassembly_limit: DEFAULT_REASSEMBLY_LIMIT,
            key_package_ttl: DEFAULT_KEY_PACKAGE_TTL,
            response_chunk_size: DEFAULT_RESPONSE_CHUNK_SIZE,
            audio_format: AudioFormat::default(),
            billing_mode: BillingMode::default(),
            allowed_voices: None,
        }
    }
}

impl EnclaveConfig {
    pub fn builder() -> EnclaveConfigBuilder {
        EnclaveConfigBuilder::default()
    }
}

/// Builder for [`EnclaveConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnclaveConfigBuilder {
    config: EnclaveConfig,
}

impl EnclaveConfigBuilder {
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn chunk_timeout(mut self, timeout: Duration) -> Self {
        self.config.chunk_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn reassembly_limit(mut self, limit: usize) -> Self {
        self.config.reassembly_limit = limit;
        self
    }

    pub fn key_package_ttl(mut self, ttl: Duration) -> Self {
        self.config.key_package_ttl = ttl;
        self
    }

    pub fn response_chunk_size(mut self, size: usize) -> Self {
        self.config.response_chunk_size = size;
        self
    }

    pub fn audio_format(mut self, format: AudioFormat) -> Self {
        self.config.audio_format = format;
        self
    }

    pub fn billing_mode(mut self, mode: BillingMode) -> Self {
        self.config.billing_mode = mode;
        self
    }

    pub fn allowed_voices<I, S>(mut self, voices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_voices = Some(voices.into_iter().map(Into::into).collect());
        self
    }

    /// Build the `EnclaveConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<EnclaveConfig, Error> {
        let c = &self.config;
        validate_common(
            c.max_payload_size,
            c.handshake_timeout,
            c.chunk_timeout,
            c.idle_timeout,
            c.reassembly_limit,
        )?;
        if c.key_package_ttl.as_secs() == 0 {
            return Err(invalid("key_package_ttl must be at least one second"));
        }
        if c.response_chunk_size == 0
            || c.response_chunk_size + RESPONSE_OVERHEAD > c.max_payload_size as usize
        {
            return Err(invalid("response_chunk_size must fit in one frame"));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let client = SessionConfig::builder().build().unwrap();
        assert_eq!(client.rotation_policy, RotationPolicy::EveryRequest);
        assert_eq!(client.chunk_timeout, DEFAULT_CHUNK_TIMEOUT);
        assert_eq!(client.reassembly_limit, DEFAULT_RESPONSE_LIMIT);

        let enclave = EnclaveConfig::builder().build().unwrap();
        assert_eq!(enclave.billing_mode, BillingMode::PerRequest);
        assert_eq!(enclave.audio_format, AudioFormat::Wav16);
    }

    #[test]
    fn zero_values_rejected() {
        assert!(SessionConfig::builder().max_payload_size(0).build().is_err());
        assert!(SessionConfig::builder()
            .handshake_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(SessionConfig::builder()
            .rotation_policy(RotationPolicy::EveryNRequests(0))
            .build()
            .is_err());
        assert!(EnclaveConfig::builder().response_chunk_size(0).build().is_err());
    }

    #[test]
    fn response_chunk_must_fit_frame() {
        let err = EnclaveConfig::builder()
            .max_payload_size(1024)
            .response_chunk_size(1024)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn allowed_voices_collected() {
        let config = EnclaveConfig::builder()
            .allowed_voices(["af_bella", "am_adam"])
            .build()
            .unwrap();
        assert_eq!(config.allowed_voices.unwrap().len(), 2);
    }
}
