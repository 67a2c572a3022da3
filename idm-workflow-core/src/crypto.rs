//! Encryption at rest for passwords held in process variables while an
//! approval form is pending.
//!
//! Each process instance gets its own AES-256-GCM key, derived from the master
//! key with HKDF-SHA256 salted by the instance id. Ciphertext is stored as
//! base64 of `nonce || ciphertext`.

use std::fmt;

use aes_gcm::{
    aead::{Aead, OsRng},
    AeadCore, Aes256Gcm, KeyInit,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const HKDF_INFO: &[u8] = b"idm-workflow-password-v1";

#[derive(Clone)]
pub struct PasswordCipher {
    master_key: [u8; KEY_LENGTH],
}

impl fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCipher")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl PasswordCipher {
    pub fn new(master_key: [u8; KEY_LENGTH]) -> Self {
        Self { master_key }
    }

    /// Random master key; ciphertext does not outlive the process.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// Master key from 64 hex characters.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim()).context("password key is not valid hex")?;
        if bytes.len() != KEY_LENGTH {
            bail!(
                "password key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            );
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key))
    }

    fn derive_key(&self, scope: &str) -> Result<[u8; KEY_LENGTH]> {
        let hkdf = Hkdf::<Sha256>::new(Some(scope.as_bytes()), &self.master_key);
        let mut derived = [0u8; KEY_LENGTH];
        hkdf.expand(HKDF_INFO, &mut derived)
            .map_err(|e| anyhow!("key derivation failed: {}", e))?;
        Ok(derived)
    }

    fn cipher(&self, scope: &str) -> Result<Aes256Gcm> {
        let key = self.derive_key(scope)?;
        Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("invalid derived key length"))
    }

    #[allow(deprecated)]
    pub fn encrypt(&self, scope: &str, plaintext: &str) -> Result<String> {
        let cipher = self.cipher(scope)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("password encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    #[allow(deprecated)]
    pub fn decrypt(&self, scope: &str, encoded: &str) -> Result<String> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("encrypted password is not valid base64")?;
        if data.len() <= NONCE_LENGTH {
            bail!("encrypted password is truncated");
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
        let cipher = self.cipher(scope)?;
        let plaintext = cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("password decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted password is not UTF-8")
    }
}

/// One-way digest stored on the identity record in place of the password.
pub fn digest_password(clear: &str) -> String {
    hex::encode(Sha256::digest(clear.as_bytes()))
}
