use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroize;

use super::SymmetricKey;
use crate::error::{CryptoError, Error, ProtocolError};

/// Builds per-message AAD: `version || msg_type || flags || session_id || epoch || sequence`.
///
/// Including `msg_type` and `flags` prevents an active attacker from flipping the
/// frame type or the final marker in the unencrypted header without breaking
/// AEAD verification.
fn build_aad(
    version: u8,
    msg_type: u8,
    flags: u8,
    session_id: &[u8; 32],
    epoch: u32,
    sequence: u32,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 1 + 1 + 32 + 4 + 4);
    aad.push(version);
    aad.push(msg_type);
    aad.push(flags);
    aad.extend_from_slice(session_id);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad
}

/// Build a 12-byte nonce `0^4 || epoch || sequence`.
///
/// Each direction has its own key per epoch, so (epoch, sequence) never
/// repeats under one key.
fn build_nonce(epoch: u32, sequence: u32) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..8].copy_from_slice(&epoch.to_be_bytes());
    nonce_bytes[8..12].copy_from_slice(&sequence.to_be_bytes());
    *Nonce::from_slice(&nonce_bytes)
}

fn wipe_cipher(cipher: &mut ChaCha20Poly1305) {
    // ChaCha20Poly1305 does not impl Zeroize. Use volatile writes to
    // clear the cipher struct (which contains the key).
    unsafe {
        let ptr = cipher as *mut ChaCha20Poly1305 as *mut u8;
        let size = core::mem::size_of::<ChaCha20Poly1305>();
        core::ptr::write_bytes(ptr, 0, size);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Context for encrypting outgoing messages within one epoch.
pub struct SealingContext {
    cipher: ChaCha20Poly1305,
    session_id: [u8; 32],
    epoch: u32,
    sequence: u32,
    exhausted: bool,
}

impl Drop for SealingContext {
    fn drop(&mut self) {
        self.session_id.zeroize();
        self.sequence = 0;
        wipe_cipher(&mut self.cipher);
    }
}

impl SealingContext {
    /// Create a new encryption context for `epoch`.
    pub fn new(key: &SymmetricKey, session_id: [u8; 32], epoch: u32) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        Self {
            cipher,
            session_id,
            epoch,
            sequence: 0,
            exhausted: false,
        }
    }

    /// Encrypt a plaintext payload. Returns ciphertext (includes AEAD tag)
    /// and the sequence number used (for the frame header).
    pub fn seal(
        &mut self,
        plaintext: &[u8],
        msg_type: u8,
        flags: u8,
    ) -> Result<(Vec<u8>, u32), CryptoError> {
        if self.exhausted {
            return Err(CryptoError::NonceOverflow);
        }
        let seq = self.sequence;
        match seq.checked_add(1) {
            Some(next) => self.sequence = next,
            None => self.exhausted = true,
        }

        let nonce = build_nonce(self.epoch, seq);
        let aad = build_aad(
            crate::frame::PROTOCOL_VERSION,
            msg_type,
            flags,
            &self.session_id,
            self.epoch,
            seq,
        );

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                chacha20poly1305::aead::Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        Ok((ciphertext, seq))
    }

    /// Current sequence number (next to be used).
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Context for decrypting incoming messages within one epoch.
pub struct OpeningContext {
    cipher: ChaCha20Poly1305,
    session_id: [u8; 32],
    epoch: u32,
    /// The next sequence number this context will accept.
    expected: u32,
}

impl Drop for OpeningContext {
    fn drop(&mut self) {
        self.session_id.zeroize();
        self.expected = 0;
        wipe_cipher(&mut self.cipher);
    }
}

impl OpeningContext {
    /// Create a new decryption context for `epoch`.
    pub fn new(key: &SymmetricKey, session_id: [u8; 32], epoch: u32) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        Self {
            cipher,
            session_id,
            epoch,
            expected: 0,
        }
    }

    /// Decrypt a ciphertext payload.
    ///
    /// The sequence must be exactly the next expected one. This is checked
    /// before the AEAD so a replayed or skipped frame is reported as such.
    pub fn open(
        &mut self,
        ciphertext: &[u8],
        sequence: u32,
        msg_type: u8,
        flags: u8,
    ) -> Result<Vec<u8>, Error> {
        if sequence < self.expected {
            return Err(ProtocolError::DuplicateSequence {
                expected: self.expected,
                received: sequence,
            }
            .into());
        }
        if sequence > self.expected {
            return Err(ProtocolError::OutOfOrderSequence {
                expected: self.expected,
                received: sequence,
            }
            .into());
        }

        let nonce = build_nonce(self.epoch, sequence);
        let aad = build_aad(
            crate::frame::PROTOCOL_VERSION,
            msg_type,
            flags,
            &self.session_id,
            self.epoch,
            sequence,
        );

        let plaintext = self
            .cipher
            .decrypt(
                &nonce,
                chacha20poly1305::aead::Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::OpenFailed)?;

        self.expected = self.expected.checked_add(1).ok_or(CryptoError::NonceOverflow)?;
        Ok(plaintext)
    }

    /// The next sequence number this context will accept.
    pub fn expected_sequence(&self) -> u32 {
        self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SymmetricKey {
        SymmetricKey::from([0x42; 32])
    }

    fn test_session_id() -> [u8; 32] {
        [0xAA; 32]
    }

    const MSG_TYPE: u8 = 0x02;
    const FLAGS: u8 = 0x01;

    #[test]
    fn seal_then_open() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 0);

        let plaintext = b"hello confidential world";
        let (ciphertext, seq) = sealer.seal(plaintext, MSG_TYPE, FLAGS).unwrap();

        let recovered = opener.open(&ciphertext, seq, MSG_TYPE, FLAGS).unwrap();
        assert_eq!(&recovered, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 0);

        let (mut ciphertext, seq) = sealer.seal(b"secret", MSG_TYPE, FLAGS).unwrap();
        ciphertext[0] ^= 0xFF;

        let result = opener.open(&ciphertext, seq, MSG_TYPE, FLAGS);
        assert!(matches!(result, Err(Error::Crypto(CryptoError::OpenFailed))));
    }

    #[test]
    fn replay_rejected_as_duplicate() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 0);

        let (ct0, seq0) = sealer.seal(b"first", MSG_TYPE, FLAGS).unwrap();
        let (ct1, seq1) = sealer.seal(b"second", MSG_TYPE, FLAGS).unwrap();

        opener.open(&ct0, seq0, MSG_TYPE, FLAGS).unwrap();
        opener.open(&ct1, seq1, MSG_TYPE, FLAGS).unwrap();

        let result = opener.open(&ct0, seq0, MSG_TYPE, FLAGS);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::DuplicateSequence {
                expected: 2,
                received: 0
            }))
        ));
    }

    #[test]
    fn gap_rejected_as_out_of_order() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 0);

        let _skipped = sealer.seal(b"first", MSG_TYPE, FLAGS).unwrap();
        let (ct1, seq1) = sealer.seal(b"second", MSG_TYPE, FLAGS).unwrap();

        let result = opener.open(&ct1, seq1, MSG_TYPE, FLAGS);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::OutOfOrderSequence { .. }))
        ));
        assert_eq!(opener.expected_sequence(), 0);
    }

    #[test]
    fn sequence_increments() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);

        assert_eq!(sealer.sequence(), 0);
        let (_, seq) = sealer.seal(b"a", MSG_TYPE, FLAGS).unwrap();
        assert_eq!(seq, 0);
        let (_, seq) = sealer.seal(b"b", MSG_TYPE, FLAGS).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(sealer.sequence(), 2);
    }

    #[test]
    fn wrong_epoch_fails() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 1);

        let (ciphertext, seq) = sealer.seal(b"secret", MSG_TYPE, FLAGS).unwrap();
        let result = opener.open(&ciphertext, seq, MSG_TYPE, FLAGS);
        assert!(matches!(result, Err(Error::Crypto(CryptoError::OpenFailed))));
    }

    #[test]
    fn flipped_final_flag_fails() {
        let key = test_key();
        let mut sealer = SealingContext::new(&key, test_session_id(), 0);
        let mut opener = OpeningContext::new(&key, test_session_id(), 0);

        let (ciphertext, seq) = sealer.seal(b"secret", MSG_TYPE, FLAGS).unwrap();
        let result = opener.open(&ciphertext, seq, MSG_TYPE, FLAGS | 0x02);
        assert!(matches!(result, Err(Error::Crypto(CryptoError::OpenFailed))));
    }
}
