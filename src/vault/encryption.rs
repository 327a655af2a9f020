//! Exchange secret encryption using AES-256-GCM with Argon2id key derivation

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Encrypted API secret with everything needed to open it again
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// AES-256-GCM ciphertext
    pub ciphertext: Vec<u8>,
    /// Salt for Argon2id key derivation (16 bytes)
    pub salt: Vec<u8>,
    /// Nonce for AES-GCM (12 bytes)
    pub nonce: Vec<u8>,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key_bytes = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| anyhow!("Failed to derive key: {}", e))?;
    Ok(key_bytes)
}

/// Seal an exchange API secret with the service passphrase
pub fn encrypt_secret(secret: &str, passphrase: &str) -> Result<EncryptedSecret> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let key_bytes = derive_key(passphrase, &salt)?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(EncryptedSecret {
        ciphertext,
        salt: salt.to_vec(),
        nonce: nonce_bytes.to_vec(),
    })
}

/// Open a sealed secret
pub fn decrypt_secret(encrypted: &EncryptedSecret, passphrase: &str) -> Result<String> {
    if encrypted.nonce.len() != 12 {
        anyhow::bail!("Corrupt secret: nonce must be 12 bytes, got {}", encrypted.nonce.len());
    }

    let key_bytes = derive_key(passphrase, &encrypted.salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&encrypted.nonce), encrypted.ciphertext.as_ref())
        .map_err(|_| anyhow!("Decryption failed - incorrect passphrase"))?;

    String::from_utf8(plaintext).context("Invalid UTF-8 in decrypted secret")
}
