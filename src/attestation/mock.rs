use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};

use super::log::InMemoryTransparencyLog;
use super::types::{
    platform_endorsement_message, AttestationQuote, HardwareRoots, MeasurementDigest,
    MeasurementRecord, ReleaseAuthorities, ReleaseStatus,
};
use super::{AttestationProvider, AttestationVerifier};
use crate::error::AttestError;

const DEFAULT_ROOT_SEED: [u8; 32] = [0xA0; 32];
const AUTHORITY_SEED: [u8; 32] = [0xB0; 32];
const PLATFORM_SEED: [u8; 32] = [0xC0; 32];

/// Software stand-in for an enclave platform and its release authority.
///
/// Quotes are genuinely signed (root → platform → quote), so the verifier
/// exercises its full chain, but every key is derived from a fixed seed.
///
/// # Security Warning
///
/// The keys are public constants. This must never be used in production.
/// Enable it only via `features = ["mock"]` for development and testing.
#[derive(Clone)]
pub struct MockPlatform {
    root: SigningKey,
    platform: SigningKey,
    authority: SigningKey,
    endorsement: [u8; 64],
    measurement: MeasurementDigest,
}

impl MockPlatform {
    /// A platform reporting `measurement`, anchored at the default root.
    pub fn new(measurement: MeasurementDigest) -> Self {
        Self::with_root(measurement, DEFAULT_ROOT_SEED)
    }

    /// A platform anchored at a different hardware root.
    pub fn with_root(measurement: MeasurementDigest, root_seed: [u8; 32]) -> Self {
        let root = SigningKey::from_bytes(&root_seed);
        let platform = SigningKey::from_bytes(&PLATFORM_SEED);
        let endorsement = root
            .sign(&platform_endorsement_message(
                &platform.verifying_key().to_bytes(),
            ))
            .to_bytes();
        Self {
            root,
            platform,
            authority: SigningKey::from_bytes(&AUTHORITY_SEED),
            endorsement,
            measurement,
        }
    }

    pub fn measurement(&self) -> MeasurementDigest {
        self.measurement
    }

    /// A verifier trusting this platform's root and release authority.
    pub fn verifier(&self) -> AttestationVerifier {
        let roots = HardwareRoots::new(&[self.root.verifying_key().to_bytes()])
            .expect("mock root key is a valid point");
        let authorities = ReleaseAuthorities::new(&[self.authority.verifying_key().to_bytes()])
            .expect("mock authority key is a valid point");
        AttestationVerifier::new(roots, authorities)
    }

    /// A release record for this platform's measurement, signed by the mock
    /// authority.
    pub fn release_record(
        &self,
        version: &str,
        commit: &str,
        status: ReleaseStatus,
    ) -> MeasurementRecord {
        MeasurementRecord::sign(&self.authority, version, commit, self.measurement, status)
    }

    /// A log in which this platform's measurement is approved.
    pub fn approved_log(&self) -> InMemoryTransparencyLog {
        let log = InMemoryTransparencyLog::new();
        log.append(self.release_record("1.0.0", "0000000", ReleaseStatus::Approved));
        log
    }
}

#[async_trait]
impl AttestationProvider for MockPlatform {
    async fn quote(
        &self,
        nonce: &[u8; 32],
        report_data: &[u8; 32],
    ) -> Result<AttestationQuote, AttestError> {
        Ok(AttestationQuote::issue(
            &self.platform,
            self.endorsement,
            self.measurement,
            *nonce,
            *report_data,
        ))
    }
}

/// Provider whose quote generation always fails.
pub struct FailingProvider;

#[async_trait]
impl AttestationProvider for FailingProvider {
    async fn quote(
        &self,
        _nonce: &[u8; 32],
        _report_data: &[u8; 32],
    ) -> Result<AttestationQuote, AttestError> {
        Err(AttestError::GenerationFailed("device unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::TransparencyLog;

    #[tokio::test]
    async fn quote_embeds_inputs() {
        let platform = MockPlatform::new([0x33; 32]);
        let quote = platform.quote(&[1; 32], &[2; 32]).await.unwrap();
        assert_eq!(quote.measurement, [0x33; 32]);
        assert_eq!(quote.nonce, [1; 32]);
        assert_eq!(quote.report_data, [2; 32]);
    }

    #[tokio::test]
    async fn approved_log_contains_measurement() {
        let platform = MockPlatform::new([0x33; 32]);
        let log = platform.approved_log();
        let record = log.lookup(&[0x33; 32]).await.unwrap();
        assert_eq!(record.status, ReleaseStatus::Approved);
    }

    #[tokio::test]
    async fn failing_provider_fails() {
        let result = FailingProvider.quote(&[0; 32], &[0; 32]).await;
        assert!(matches!(result, Err(AttestError::GenerationFailed(_))));
    }
}
