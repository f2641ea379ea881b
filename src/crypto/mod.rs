pub mod kex;
pub mod seal;
pub mod transcript;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte symmetric key, zeroed on drop. Neither `Clone` nor `Debug`.
#[derive(Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SymmetricKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// 32-byte X25519 public key.
pub type PublicKey = [u8; 32];
