use crate::transform::Wrapper;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io;

/// Compute the SHA256 key used by [`XorWrapper`]
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// XorWrapper masks every byte with a repeating 32-byte key
#[derive(Clone, PartialEq, Eq)]
pub struct XorWrapper {
    key: [u8; 32],
}

impl std::fmt::Debug for XorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorWrapper").finish_non_exhaustive()
    }
}

impl XorWrapper {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the key from a passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(derive_key(passphrase))
    }

    fn apply(&self, data: &[u8]) -> Bytes {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect::<Vec<u8>>()
            .into()
    }
}

impl Wrapper for XorWrapper {
    fn wrap(&self, data: Bytes) -> io::Result<Bytes> {
        Ok(self.apply(&data))
    }

    fn unwrap(&self, data: Bytes) -> io::Result<Bytes> {
        Ok(self.apply(&data))
    }
}
