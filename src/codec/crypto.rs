//! Authenticated payload encryption: AES-256-GCM.
//!
//! The ciphertext wire form is `base64(iv || ciphertext+tag)` with a
//! 12-byte IV. The IV is freshly random per message unless a fixed IV
//! was configured, which is accepted but warned about: nonce reuse under
//! the same key voids the AEAD guarantees.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::EncryptionConfig;
use crate::error::{Result, WireError};

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;
/// IV length in bytes, prepended to every ciphertext.
pub const IV_LEN: usize = 12;

/// AES-256-GCM encryptor bound to one key.
pub struct Encryptor {
    cipher: Aes256Gcm,
    fixed_iv: Option<[u8; IV_LEN]>,
}

impl Encryptor {
    /// Validate the config and bind the key.
    ///
    /// Fails when the key is absent or mis-sized, or when a configured
    /// fixed IV is mis-sized. Key material problems are construction
    /// errors, never runtime surprises.
    pub fn new(config: &EncryptionConfig) -> Result<Self> {
        let key = config
            .key
            .as_deref()
            .ok_or_else(|| WireError::Encryption("encryption enabled without a key".into()))?;
        if key.len() != KEY_LEN {
            return Err(WireError::Encryption(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| WireError::Encryption("invalid key material".into()))?;

        let fixed_iv = match config.iv.as_deref() {
            Some(iv) => {
                if iv.len() != IV_LEN {
                    return Err(WireError::Encryption(format!(
                        "fixed IV must be {IV_LEN} bytes, got {}",
                        iv.len()
                    )));
                }
                tracing::warn!("fixed encryption IV configured; nonce reuse weakens AES-GCM");
                let mut buf = [0u8; IV_LEN];
                buf.copy_from_slice(iv);
                Some(buf)
            }
            None => None,
        };

        Ok(Self { cipher, fixed_iv })
    }

    /// Encrypt `plaintext` to `base64(iv || ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let iv: [u8; IV_LEN] = match self.fixed_iv {
            Some(iv) => iv,
            None => rand::random(),
        };
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| WireError::Encryption("encryption failed".into()))?;

        let mut framed = Vec::with_capacity(IV_LEN + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt `base64(iv || ciphertext)`, verifying the tag.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let framed = BASE64
            .decode(encoded)
            .map_err(|e| WireError::Encryption(format!("ciphertext is not base64: {e}")))?;
        if framed.len() < IV_LEN {
            return Err(WireError::Encryption("ciphertext shorter than IV".into()));
        }
        let (iv, ciphertext) = framed.split_at(IV_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| WireError::Encryption("authentication tag verification failed".into()))
    }
}
