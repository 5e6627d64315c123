//! AEAD Cipher Abstraction
//!
//! Two interchangeable 256-bit-key, 96-bit-nonce, 128-bit-tag AEAD
//! constructions behind one [`Cipher`] trait:
//!
//! - **ChaCha20-Poly1305** (default)
//! - **AES-256-GCM**
//!
//! The cipher owns the only long-lived copy of the key. The primitive is
//! instantiated from that buffer per operation, so [`Cipher::destroy`]
//! zeroes every byte of key material the cipher holds. After destruction
//! every operation fails with [`CryptoError::Destroyed`].

use crate::protocol::NONCE_SIZE;
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zeroize::Zeroize;

/// Key size shared by both suites
pub const KEY_SIZE: usize = 32;

/// Authentication tag size shared by both suites
pub const TAG_SIZE: usize = 16;

/// Cipher suite selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherSuite {
    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherSuite::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CipherSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(CipherSuite::Aes256Gcm),
            _ => Err(CryptoError::UnknownSuite(s.to_string())),
        }
    }
}

/// Authenticated encryption primitive used by the forwarding engine
pub trait Cipher: Send + Sync {
    /// Suite this cipher implements
    fn suite(&self) -> CipherSuite;

    /// Encrypt `plaintext`, returning `ciphertext ‖ tag`
    fn encrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify and decrypt `ciphertext ‖ tag`
    fn decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Fail-closed decrypt for the receive path
    fn try_decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Option<Vec<u8>> {
        self.decrypt(nonce, ciphertext, aad).ok()
    }

    /// Zero the key material. Idempotent.
    fn destroy(&self);

    /// Has `destroy` been called?
    fn is_destroyed(&self) -> bool;

    /// Does the backing key buffer read as all zero?
    fn key_is_zeroed(&self) -> bool;
}

/// Create a cipher for `suite` from exactly [`KEY_SIZE`] key bytes
pub fn create_cipher(suite: CipherSuite, key: &[u8]) -> Result<Box<dyn Cipher>, CryptoError> {
    Ok(match suite {
        CipherSuite::ChaCha20Poly1305 => Box::new(ChaCha20Poly1305Cipher::new(key)?),
        CipherSuite::Aes256Gcm => Box::new(Aes256GcmCipher::new(key)?),
    })
}

/// Owned key buffer
struct KeySlot {
    bytes: [u8; KEY_SIZE],
    destroyed: bool,
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Maps an AEAD primitive type to its suite
pub trait Suite {
    const SUITE: CipherSuite;
}

impl Suite for ChaCha20Poly1305 {
    const SUITE: CipherSuite = CipherSuite::ChaCha20Poly1305;
}

impl Suite for Aes256Gcm {
    const SUITE: CipherSuite = CipherSuite::Aes256Gcm;
}

/// AEAD cipher over any RustCrypto primitive with a 32-byte key
pub struct AeadCipher<A> {
    key: RwLock<KeySlot>,
    _primitive: PhantomData<fn() -> A>,
}

/// ChaCha20-Poly1305 cipher
pub type ChaCha20Poly1305Cipher = AeadCipher<ChaCha20Poly1305>;

/// AES-256-GCM cipher
pub type Aes256GcmCipher = AeadCipher<Aes256Gcm>;

impl<A> AeadCipher<A>
where
    A: Aead + KeyInit + Suite,
{
    /// Copy `key` into a cipher-owned buffer
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::KeySize {
                expected: KEY_SIZE,
                got: key.len(),
            });
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(key);

        Ok(Self {
            key: RwLock::new(KeySlot {
                bytes,
                destroyed: false,
            }),
            _primitive: PhantomData,
        })
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, KeySlot> {
        self.key.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, KeySlot> {
        self.key.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Instantiate the primitive while holding the key read lock
    fn with_primitive<T>(
        &self,
        op: impl FnOnce(&A) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let slot = self.read_slot();
        if slot.destroyed {
            return Err(CryptoError::Destroyed);
        }
        let primitive = A::new_from_slice(&slot.bytes).map_err(|_| CryptoError::KeySize {
            expected: KEY_SIZE,
            got: slot.bytes.len(),
        })?;
        op(&primitive)
    }
}

impl<A> Cipher for AeadCipher<A>
where
    A: Aead + KeyInit + Suite,
{
    fn suite(&self) -> CipherSuite {
        A::SUITE
    }

    fn encrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.with_primitive(|aead| {
            aead.encrypt(
                GenericArray::from_slice(nonce),
                Payload { msg: plaintext, aad },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
        })
    }

    fn decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            // Check destruction first so a destroyed cipher always says so
            if self.is_destroyed() {
                return Err(CryptoError::Destroyed);
            }
            return Err(CryptoError::TooShort {
                min: TAG_SIZE,
                got: ciphertext.len(),
            });
        }

        self.with_primitive(|aead| {
            aead.decrypt(
                GenericArray::from_slice(nonce),
                Payload { msg: ciphertext, aad },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
        })
    }

    fn destroy(&self) {
        let mut slot = self.write_slot();
        slot.bytes.zeroize();
        slot.destroyed = true;
    }

    fn is_destroyed(&self) -> bool {
        self.read_slot().destroyed
    }

    fn key_is_zeroed(&self) -> bool {
        self.read_slot().bytes.iter().all(|b| *b == 0)
    }
}

impl<A: Suite> fmt::Debug for AeadCipher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AeadCipher({}, [redacted])", A::SUITE)
    }
}

/// Cipher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key size: expected {expected} bytes, got {got}")]
    KeySize { expected: usize, got: usize },

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Ciphertext too short: need at least {min} bytes, got {got}")]
    TooShort { min: usize, got: usize },

    #[error("Cipher has been destroyed")]
    Destroyed,

    #[error("Unknown cipher suite: {0}")]
    UnknownSuite(String),
}
