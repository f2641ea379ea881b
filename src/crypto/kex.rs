use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::SymmetricKey;
use crate::error::CryptoError;

/// An X25519 key pair, generated fresh for every handshake attempt.
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Perform X25519 Diffie-Hellman and derive the epoch-0 root secret.
///
/// Both sides obtain the same root; direction keys are split from it later by
/// the ratchet, so no initiator flag is needed here.
pub fn derive_root_secret(
    our_secret: &StaticSecret,
    their_public: &PublicKey,
    transcript_hash: &[u8; 32],
) -> Result<SymmetricKey, CryptoError> {
    let shared_secret = our_secret.diffie_hellman(their_public);
    if !shared_secret.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret.as_bytes());
    let mut root = [0u8; 32];
    hkdf.expand(b"tts-epoch-root-0", &mut root)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    let key = SymmetricKey::from(root);
    zeroize::Zeroize::zeroize(&mut root);
    Ok(key)
}

/// Derive the session ID from the transcript hash (domain-separated from key material).
pub fn derive_session_id(transcript_hash: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, transcript_hash);
    let mut session_id = [0u8; 32];
    hkdf.expand(b"tts-session-id", &mut session_id)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    Ok(session_id)
}
