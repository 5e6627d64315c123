//! Pre-shared Key Management
//!
//! Loads the 32-byte symmetric tunnel key from base64 text or a key file.
//! The buffer is zeroized when the key is dropped and is never `Clone`.

use crate::crypto::KEY_SIZE;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};

/// Symmetric key shared with the server out of band
pub struct PresharedKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl PresharedKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    /// Create from raw bytes (must be exactly 32)
    pub fn from_slice(raw: &[u8]) -> Result<Self, KeyError> {
        if raw.len() != KEY_SIZE {
            return Err(KeyError::InvalidLength(raw.len()));
        }
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(
            BASE64
                .decode(s.trim())
                .map_err(|_| KeyError::InvalidBase64)?,
        );
        Self::from_slice(&decoded)
    }

    /// Load from a file holding either base64 text or 32 raw bytes
    pub fn from_file(path: &Path) -> Result<Self, KeyError> {
        let mut content = std::fs::read(path)
            .map_err(|e| KeyError::Io(format!("{}: {}", path.display(), e)))?;

        let key = if content.len() == KEY_SIZE {
            Self::from_slice(&content)
        } else {
            match std::str::from_utf8(&content) {
                Ok(text) => Self::from_base64(text),
                Err(_) => Err(KeyError::InvalidLength(content.len())),
            }
        };

        content.zeroize();
        key
    }

    /// Borrow the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes[..])
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey([redacted])")
    }
}

/// Key loading errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Cannot read key file {0}")]
    Io(String),
}
