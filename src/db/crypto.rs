//! Encryption of the stored database password.
//!
//! This keeps the password out of the config file in plain text; it is not a
//! defence against someone who has this binary. The key is derived once from
//! a fixed application salt.

use anyhow::{anyhow, Result};
use base64::Engine;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const PASSWORD_SALT: &[u8] = b"clepho/database/encrypted_password";
const PASSWORD_AAD: &[u8] = b"database";
const NONCE_LEN: usize = 24;

fn password_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(PASSWORD_SALT));
        key
    })
}

/// Encrypt `password` into a base64 string. An empty password stays empty.
pub fn encrypt_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Ok(String::new());
    }

    let cipher = XChaCha20Poly1305::new_from_slice(password_key())
        .map_err(|_| anyhow!("invalid key"))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: password.as_bytes(),
                aad: PASSWORD_AAD,
            },
        )
        .map_err(|_| anyhow!("encrypt failed"))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Reverse of [`encrypt_password`].
pub fn decrypt_password(encoded: &str) -> Result<String> {
    if encoded.is_empty() {
        return Ok(String::new());
    }

    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("invalid base64: {}", e))?;

    if blob.len() < NONCE_LEN {
        return Err(anyhow!("ciphertext too short"));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(password_key())
        .map_err(|_| anyhow!("invalid key"))?;

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: PASSWORD_AAD,
            },
        )
        .map_err(|_| anyhow!("decrypt failed"))?;

    String::from_utf8(plaintext).map_err(|_| anyhow!("password is not valid UTF-8"))
}
