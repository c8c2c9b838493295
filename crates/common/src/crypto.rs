//! Cryptographic primitives for the trust layer.
//!
//! This module provides the authenticated encryption used for TOTP secrets
//! at rest, the keyed digests used for backup codes, and secure random
//! code generation.
//!
//! # Examples
//!
//! ```
//! use base64::{Engine, engine::general_purpose::STANDARD};
//! use vigil_common::crypto::SecretCipher;
//!
//! let key = STANDARD.encode([7u8; 32]);
//! let cipher = SecretCipher::from_base64(&key).expect("valid key");
//!
//! let sealed = cipher.encrypt("JBSWY3DPEHPK3PXP").expect("encrypt");
//! let opened = cipher.decrypt(&sealed).expect("decrypt");
//! assert_eq!(opened, "JBSWY3DPEHPK3PXP");
//! ```

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;

use crate::{AppError, AppResult};

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Required key size in bytes.
const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated encryption for secrets at rest.
///
/// Wraps ChaCha20-Poly1305 with a fresh random nonce per encryption; the
/// sealed form is `base64(nonce || ciphertext)`.
#[derive(Clone)]
pub struct SecretCipher {
    key: Key,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never appear in logs.
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Create a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> AppResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| AppError::Config(format!("Invalid encryption key encoding: {e}")))?;

        if bytes.len() != KEY_SIZE {
            return Err(AppError::Config(format!(
                "Encryption key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            key: *Key::from_slice(&bytes),
        })
    }

    /// Encrypt a plaintext secret, returning `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let cipher = ChaCha20Poly1305::new(&self.key);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| AppError::Crypto(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a sealed secret produced by [`Self::encrypt`].
    ///
    /// Fails with [`AppError::Crypto`] if the ciphertext was tampered with
    /// or was sealed under a different key.
    pub fn decrypt(&self, sealed: &str) -> AppResult<String> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| AppError::MalformedStoredData(format!("Invalid sealed secret: {e}")))?;

        if bytes.len() <= NONCE_SIZE {
            return Err(AppError::MalformedStoredData(
                "Sealed secret too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(&self.key);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| AppError::Crypto(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| AppError::MalformedStoredData(format!("Secret is not UTF-8: {e}")))
    }
}

/// Compute the keyed digest of a backup code.
///
/// Codes are persisted only in this form; redemption looks the digest up
/// by exact value, so there is no per-entry comparison to time.
pub fn code_digest(mac_key: &[u8], code: &str) -> AppResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| AppError::Crypto(format!("Invalid MAC key: {e}")))?;
    mac.update(code.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Generate a uniformly random numeric code of the given length.
#[must_use]
pub fn random_numeric_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}
