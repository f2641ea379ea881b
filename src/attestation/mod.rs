pub mod log;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use async_trait::async_trait;

use crate::error::AttestError;
use types::{
    AttestationQuote, HardwareRoots, MeasurementDigest, MeasurementRecord, ReleaseAuthorities,
    ReleaseStatus, VerifiedMeasurement,
};

/// Provider that produces attestation quotes (runs inside the enclave).
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Produce a quote over the client's `nonce`, committing to `report_data`
    /// (the public half of the per-handshake binding key).
    async fn quote(
        &self,
        nonce: &[u8; 32],
        report_data: &[u8; 32],
    ) -> Result<AttestationQuote, AttestError>;
}

/// Read-only view of the append-only measurement ledger.
///
/// Passed explicitly to the verifier so tests can substitute a fixture.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    /// Every record logged for `measurement`, oldest first.
    async fn history(&self, measurement: &MeasurementDigest) -> Vec<MeasurementRecord>;

    /// Latest record for `measurement`, or `None` if it was never logged.
    async fn lookup(&self, measurement: &MeasurementDigest) -> Option<MeasurementRecord> {
        self.history(measurement).await.pop()
    }
}

/// Validates quotes against the hardware roots and the transparency log.
///
/// Verification is deterministic for the same inputs and has no side effects
/// beyond an audit log line.
#[derive(Debug, Clone)]
pub struct AttestationVerifier {
    roots: HardwareRoots,
    authorities: ReleaseAuthorities,
}

impl AttestationVerifier {
    pub fn new(roots: HardwareRoots, authorities: ReleaseAuthorities) -> Self {
        Self { roots, authorities }
    }

    /// Verify `quote` in order: signature chain, challenge nonce, then the
    /// measurement's records in `trusted_log`. The first failure is returned.
    ///
    /// A measurement is accepted only if an authority signed an approval for
    /// it and no authority ever signed its revocation. Revocation is final:
    /// records appended after it cannot restore the measurement.
    pub async fn verify(
        &self,
        quote: &AttestationQuote,
        challenge_nonce: &[u8; 32],
        trusted_log: &dyn TransparencyLog,
    ) -> Result<VerifiedMeasurement, AttestError> {
        quote.verify_chain(&self.roots)?;

        if &quote.nonce != challenge_nonce {
            return Err(AttestError::ExpiredOrMismatchedNonce);
        }

        let mut approved = None;
        let signed = trusted_log
            .history(&quote.measurement)
            .await
            .into_iter()
            .filter(|r| r.measurement == quote.measurement && r.is_signed_by(&self.authorities));
        for record in signed {
            match record.status {
                ReleaseStatus::Revoked => {
                    tracing::warn!(version = %record.version, "measurement revoked");
                    return Err(AttestError::UnknownOrRevokedMeasurement);
                }
                ReleaseStatus::Approved => approved = Some(record),
            }
        }
        let record = approved.ok_or(AttestError::UnknownOrRevokedMeasurement)?;

        tracing::info!(
            target: "audit",
            version = %record.version,
            commit = %record.commit,
            "enclave measurement verified"
        );

        Ok(VerifiedMeasurement {
            measurement: quote.measurement,
            version: record.version,
            commit: record.commit,
            binding_key: quote.report_data,
            quote_hash: quote.hash(),
        })
    }
}
