//! At-rest encryption for DNS provider credentials.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// AES-256 key size in bytes
const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key file {0}: {1}")]
    KeyFile(PathBuf, std::io::Error),
}

/// Encryption key for stored credentials
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Create a new random encryption key
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        getrandom::fill(&mut key)
            .map_err(|e| CryptoError::InvalidKey(format!("operating system RNG unavailable: {e}")))?;
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Load the key at `path`, generating and persisting a new one (mode 0600)
    /// when the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => return Self::from_base64(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CryptoError::KeyFile(path.to_path_buf(), e)),
        }

        let key = Self::generate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyFile(parent.to_path_buf(), e))?;
        }
        std::fs::write(path, key.to_base64())
            .map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?;
        }
        tracing::info!(path = %path.display(), "Generated credential encryption key");
        Ok(key)
    }
}

/// Encrypt a plaintext string using AES-256-GCM
///
/// Returns a base64-encoded string containing: nonce (12 bytes) + ciphertext
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.key)
        .map_err(|e| CryptoError::Encryption(format!("failed to create cipher: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce_bytes)
        .map_err(|e| CryptoError::Encryption(format!("failed to generate nonce: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(combined))
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(encrypted: &str, key: &EncryptionKey) -> Result<String, CryptoError> {
    let combined = BASE64
        .decode(encrypted)
        .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;

    if combined.len() < NONCE_SIZE {
        return Err(CryptoError::Decryption("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key.key)
        .map_err(|e| CryptoError::Decryption(format!("failed to create cipher: {e}")))?;

    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
        CryptoError::Decryption("wrong key or corrupted data".to_string())
    })?;

    String::from_utf8(plaintext).map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))
}
