use sha2::{Digest, Sha256};

use super::PublicKey;
use crate::frame::PROTOCOL_VERSION;

/// Compute the transcript hash binding the session to the attested instance.
///
/// `transcript = SHA256(label || nonce || SHA256(quote) || key_package || client_pk || version)`
///
/// The quote hash ties the derived keys to the exact quote that passed
/// verification, and the key package ties them to the enclave half of the
/// exchange. A substituted quote or key package yields a different root.
pub fn compute_transcript(
    nonce: &[u8; 32],
    quote: &[u8],
    key_package: &[u8],
    client_public: &PublicKey,
) -> [u8; 32] {
    let quote_hash: [u8; 32] = Sha256::digest(quote).into();

    let mut hasher = Sha256::new();
    hasher.update(b"tts-transcript-v1");
    hasher.update(nonce);
    hasher.update(quote_hash);
    hasher.update((key_package.len() as u32).to_be_bytes());
    hasher.update(key_package);
    hasher.update(client_public);
    hasher.update([PROTOCOL_VERSION]);

    hasher.finalize().into()
}
