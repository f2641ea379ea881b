use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AttestError;

/// Digest identifying an exact build/boot configuration.
pub type MeasurementDigest = [u8; 32];

/// Quote magic: "TTSQ".
pub const QUOTE_MAGIC: &[u8; 4] = b"TTSQ";

/// Current quote layout version.
pub const QUOTE_VERSION: u8 = 1;

/// Total quote length: magic + version + measurement + nonce + report data +
/// platform key + platform endorsement + quote signature.
pub const QUOTE_LEN: usize = 4 + 1 + 32 + 32 + 32 + 32 + 64 + 64;

/// Length of the signed portion of a quote (everything but the final signature).
const QUOTE_SIGNED_LEN: usize = QUOTE_LEN - 64;

/// Key package length: X25519 public key + expiry.
pub const KEY_PACKAGE_LEN: usize = 32 + 8;

const PLATFORM_DOMAIN: &[u8] = b"tts-platform-v1";
const BINDING_DOMAIN: &[u8] = b"tts-binding-v1";
const RELEASE_DOMAIN: &[u8] = b"tts-release-v1";

fn verifying_key(bytes: &[u8; 32]) -> Result<VerifyingKey, AttestError> {
    VerifyingKey::from_bytes(bytes).map_err(|_| AttestError::InvalidSignature)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Message the hardware root signs to endorse a platform key.
pub fn platform_endorsement_message(platform_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PLATFORM_DOMAIN.len() + 32);
    msg.extend_from_slice(PLATFORM_DOMAIN);
    msg.extend_from_slice(platform_key);
    msg
}

/// Hardware-signed statement of the measurement of a running enclave.
///
/// Layout: `"TTSQ" | version | measurement | nonce | report_data |
/// platform_key | platform_endorsement | signature`. The hardware root
/// endorses `platform_key`; the platform key signs every preceding byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationQuote {
    raw: Bytes,
    pub measurement: MeasurementDigest,
    pub nonce: [u8; 32],
    /// Public key of the per-handshake binding key.
    pub report_data: [u8; 32],
    pub platform_key: [u8; 32],
    pub platform_endorsement: [u8; 64],
    pub signature: [u8; 64],
}

impl AttestationQuote {
    /// Parse a quote from its wire bytes. Only the layout is checked here.
    pub fn parse(raw: &[u8]) -> Result<Self, AttestError> {
        if raw.len() != QUOTE_LEN {
            return Err(AttestError::Malformed("quote length"));
        }
        if &raw[..4] != QUOTE_MAGIC {
            return Err(AttestError::Malformed("quote magic"));
        }
        if raw[4] != QUOTE_VERSION {
            return Err(AttestError::Malformed("quote version"));
        }

        let mut cursor = &raw[5..];
        let mut measurement = [0u8; 32];
        cursor.copy_to_slice(&mut measurement);
        let mut nonce = [0u8; 32];
        cursor.copy_to_slice(&mut nonce);
        let mut report_data = [0u8; 32];
        cursor.copy_to_slice(&mut report_data);
        let mut platform_key = [0u8; 32];
        cursor.copy_to_slice(&mut platform_key);
        let mut platform_endorsement = [0u8; 64];
        cursor.copy_to_slice(&mut platform_endorsement);
        let mut signature = [0u8; 64];
        cursor.copy_to_slice(&mut signature);

        Ok(Self {
            raw: Bytes::copy_from_slice(raw),
            measurement,
            nonce,
            report_data,
            platform_key,
            platform_endorsement,
            signature,
        })
    }

    /// Assemble and sign a quote with a platform key already endorsed by a
    /// hardware root.
    pub fn issue(
        platform: &SigningKey,
        platform_endorsement: [u8; 64],
        measurement: MeasurementDigest,
        nonce: [u8; 32],
        report_data: [u8; 32],
    ) -> Self {
        let platform_key = platform.verifying_key().to_bytes();
        let mut raw = Vec::with_capacity(QUOTE_LEN);
        raw.extend_from_slice(QUOTE_MAGIC);
        raw.push(QUOTE_VERSION);
        raw.extend_from_slice(&measurement);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&report_data);
        raw.extend_from_slice(&platform_key);
        raw.extend_from_slice(&platform_endorsement);
        let signature = platform.sign(&raw).to_bytes();
        raw.extend_from_slice(&signature);

        Self {
            raw: Bytes::from(raw),
            measurement,
            nonce,
            report_data,
            platform_key,
            platform_endorsement,
            signature,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// SHA-256 of the full quote.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.raw).into()
    }

    /// Check the two-link chain: a known root endorses the platform key, and
    /// the platform key signed the quote body.
    pub(crate) fn verify_chain(&self, roots: &HardwareRoots) -> Result<(), AttestError> {
        let endorsement = Signature::from_bytes(&self.platform_endorsement);
        let endorsement_msg = platform_endorsement_message(&self.platform_key);
        if !roots.endorses(&endorsement_msg, &endorsement) {
            return Err(AttestError::InvalidSignature);
        }

        let platform = verifying_key(&self.platform_key)?;
        let signature = Signature::from_bytes(&self.signature);
        platform
            .verify_strict(&self.raw[..QUOTE_SIGNED_LEN], &signature)
            .map_err(|_| AttestError::InvalidSignature)
    }
}

/// Session key-exchange material offered by one enclave instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPackage {
    pub public_key: [u8; 32],
    /// Expiry as unix seconds.
    pub expires_at: u64,
}

impl KeyPackage {
    pub fn new(public_key: [u8; 32], ttl: Duration) -> Self {
        Self {
            public_key,
            expires_at: unix_now().saturating_add(ttl.as_secs()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(KEY_PACKAGE_LEN);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.expires_at.to_be_bytes());
        Bytes::from(buf)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, AttestError> {
        if raw.len() != KEY_PACKAGE_LEN {
            return Err(AttestError::Malformed("key package length"));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&raw[..32]);
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&raw[32..]);
        Ok(Self {
            public_key,
            expires_at: u64::from_be_bytes(expiry),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }
}

/// Proof that a key package and quote come from the same attested instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSignature(pub [u8; 64]);

impl BindingSignature {
    fn message(quote: &[u8], key_package: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(BINDING_DOMAIN.len() + 4 + quote.len() + key_package.len());
        msg.extend_from_slice(BINDING_DOMAIN);
        msg.extend_from_slice(&(quote.len() as u32).to_be_bytes());
        msg.extend_from_slice(quote);
        msg.extend_from_slice(key_package);
        msg
    }

    /// Sign `(quote ‖ key_package)` with the binding key named in the quote.
    pub fn sign(binding_key: &SigningKey, quote: &[u8], key_package: &[u8]) -> Self {
        Self(binding_key.sign(&Self::message(quote, key_package)).to_bytes())
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, AttestError> {
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| AttestError::Malformed("binding signature length"))?;
        Ok(Self(bytes))
    }

    /// Verify the signature covers exactly this quote and key package.
    pub fn verify(
        &self,
        binding_key: &[u8; 32],
        quote: &[u8],
        key_package: &[u8],
    ) -> Result<(), AttestError> {
        let key = verifying_key(binding_key)?;
        key.verify_strict(
            &Self::message(quote, key_package),
            &Signature::from_bytes(&self.0),
        )
        .map_err(|_| AttestError::InvalidSignature)
    }
}

/// Release state of a logged measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Approved,
    Revoked,
}

impl ReleaseStatus {
    fn as_byte(self) -> u8 {
        match self {
            Self::Approved => 1,
            Self::Revoked => 2,
        }
    }
}

/// An approved (or revoked) build fingerprint, signed by a release authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub version: String,
    pub commit: String,
    #[serde(with = "hex")]
    pub measurement: MeasurementDigest,
    pub status: ReleaseStatus,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl MeasurementRecord {
    fn signed_message(
        version: &str,
        commit: &str,
        measurement: &MeasurementDigest,
        status: ReleaseStatus,
    ) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(RELEASE_DOMAIN);
        msg.extend_from_slice(&(version.len() as u32).to_be_bytes());
        msg.extend_from_slice(version.as_bytes());
        msg.extend_from_slice(&(commit.len() as u32).to_be_bytes());
        msg.extend_from_slice(commit.as_bytes());
        msg.extend_from_slice(measurement);
        msg.push(status.as_byte());
        msg
    }

    /// Create a record signed by `authority`.
    pub fn sign(
        authority: &SigningKey,
        version: impl Into<String>,
        commit: impl Into<String>,
        measurement: MeasurementDigest,
        status: ReleaseStatus,
    ) -> Self {
        let version = version.into();
        let commit = commit.into();
        let msg = Self::signed_message(&version, &commit, &measurement, status);
        Self {
            signature: authority.sign(&msg).to_bytes().to_vec(),
            version,
            commit,
            measurement,
            status,
        }
    }

    /// Whether one of `authorities` signed exactly this record.
    pub fn is_signed_by(&self, authorities: &ReleaseAuthorities) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        let msg = Self::signed_message(&self.version, &self.commit, &self.measurement, self.status);
        authorities
            .keys
            .iter()
            .any(|key| key.verify_strict(&msg, &signature).is_ok())
    }
}

/// Hardware root-of-trust public keys accepted as quote chain anchors.
#[derive(Debug, Clone)]
pub struct HardwareRoots {
    keys: Vec<VerifyingKey>,
}

impl HardwareRoots {
    pub fn new(keys: &[[u8; 32]]) -> Result<Self, AttestError> {
        let keys = keys
            .iter()
            .map(verifying_key)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    fn endorses(&self, msg: &[u8], signature: &Signature) -> bool {
        self.keys
            .iter()
            .any(|root| root.verify_strict(msg, signature).is_ok())
    }
}

/// Release authority public keys allowed to sign measurement records.
#[derive(Debug, Clone)]
pub struct ReleaseAuthorities {
    keys: Vec<VerifyingKey>,
}

impl ReleaseAuthorities {
    pub fn new(keys: &[[u8; 32]]) -> Result<Self, AttestError> {
        let keys = keys
            .iter()
            .map(verifying_key)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }
}

/// Outcome of a successful [`AttestationVerifier::verify`](super::AttestationVerifier::verify).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMeasurement {
    pub measurement: MeasurementDigest,
    pub version: String,
    pub commit: String,
    /// Binding key the enclave committed to inside the quote.
    pub binding_key: [u8; 32],
    pub quote_hash: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn quote_parse_matches_issue() {
        let platform = key(2);
        let endorsement = key(1)
            .sign(&platform_endorsement_message(&platform.verifying_key().to_bytes()))
            .to_bytes();
        let quote = AttestationQuote::issue(&platform, endorsement, [3; 32], [4; 32], [5; 32]);
        let parsed = AttestationQuote::parse(quote.as_bytes()).unwrap();
        assert_eq!(parsed, quote);
        assert_eq!(parsed.as_bytes().len(), QUOTE_LEN);
    }

    #[test]
    fn quote_rejects_wrong_length() {
        assert_eq!(
            AttestationQuote::parse(&[0u8; QUOTE_LEN - 1]),
            Err(AttestError::Malformed("quote length"))
        );
    }

    #[test]
    fn binding_signature_covers_key_package() {
        let binding = key(9);
        let sig = BindingSignature::sign(&binding, b"quote", b"package");
        let public = binding.verifying_key().to_bytes();
        assert!(sig.verify(&public, b"quote", b"package").is_ok());
        assert_eq!(
            sig.verify(&public, b"quote", b"packagf"),
            Err(AttestError::InvalidSignature)
        );
        // Moving a byte across the quote/key-package boundary must not verify.
        assert!(sig.verify(&public, b"quotep", b"ackage").is_err());
    }

    #[test]
    fn record_signature_covers_status() {
        let authority = key(7);
        let authorities =
            ReleaseAuthorities::new(&[authority.verifying_key().to_bytes()]).unwrap();
        let mut record =
            MeasurementRecord::sign(&authority, "1.0.0", "abc123", [1; 32], ReleaseStatus::Revoked);
        assert!(record.is_signed_by(&authorities));
        record.status = ReleaseStatus::Approved;
        assert!(!record.is_signed_by(&authorities));
    }

    #[test]
    fn key_package_expiry() {
        let fresh = KeyPackage::new([1; 32], Duration::from_secs(60));
        assert!(!fresh.is_expired());
        let stale = KeyPackage {
            public_key: [1; 32],
            expires_at: 0,
        };
        assert!(stale.is_expired());
        assert_eq!(KeyPackage::decode(&fresh.encode()).unwrap(), fresh);
    }

    #[test]
    fn record_json_uses_hex() {
        let record =
            MeasurementRecord::sign(&key(7), "1.0.0", "abc123", [0xAB; 32], ReleaseStatus::Approved);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(&"ab".repeat(32)));
        assert!(json.contains("\"approved\""));
        let back: MeasurementRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
