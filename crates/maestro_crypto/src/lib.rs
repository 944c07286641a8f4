//! Encryption for secrets at rest.
//!
//! External-database connection secrets and singleton configuration
//! secrets are stored in the catalog encrypted with AES-GCM-256. The key
//! is derived from a deployer-supplied secret, right-padded with a fixed
//! pad to 32 bytes; the random nonce is prefixed to the ciphertext and
//! the whole thing is URL-safe base64.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;

const KEY_PAD: &str = "l@te f33 app13z @f+r";
const KEY_LEN: usize = 32;
const MIN_SECRET_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret too short")]
    SecretTooShort,
    #[error("ciphertext too short: {0}")]
    CiphertextTooShort(usize),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decrypted text is not UTF-8")]
    NotUtf8,
    #[error("cipher failure")]
    Cipher,
}

fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut padded = secret.to_string();
    while padded.len() < KEY_LEN {
        padded.push_str(KEY_PAD);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&padded.as_bytes()[..KEY_LEN]);
    key
}

/// Encrypt `text` with a key derived from `secret`. The secret must be
/// at least 8 characters.
pub fn encrypt_string(text: &str, secret: &str) -> Result<String, CryptoError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(CryptoError::SecretTooShort);
    }
    let key = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, text.as_bytes())
        .map_err(|_| CryptoError::Cipher)?;

    let mut out = Vec::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(URL_SAFE.encode(out))
}

/// Decrypt a string produced by [`encrypt_string`] with the same secret.
pub fn decrypt_string(text: &str, secret: &str) -> Result<String, CryptoError> {
    let key = derive_key(secret);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let raw = URL_SAFE.decode(text)?;
    let nsize = 12; // AES-GCM standard nonce size
    if raw.len() < nsize {
        return Err(CryptoError::CiphertextTooShort(raw.len()));
    }
    let (nonce, sealed) = raw.split_at(nsize);
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Cipher)?;
    String::from_utf8(plain).map_err(|_| CryptoError::NotUtf8)
}

/// Generate a 32-byte secure random token.
pub fn generate_token() -> [u8; 32] {
    let mut token = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let secret = "a secret longer than eight";
        for text in ["hello", "with\nnewlines\tand &?= chars", "日本語"] {
            let sealed = encrypt_string(text, secret).unwrap();
            assert_ne!(sealed, text);
            assert_eq!(decrypt_string(&sealed, secret).unwrap(), text);
        }
    }

    #[test]
    fn minimum_secret_length_enforced() {
        assert!(matches!(
            encrypt_string("text", "short"),
            Err(CryptoError::SecretTooShort)
        ));
        assert!(encrypt_string("text", "12345678").is_ok());
    }

    #[test]
    fn nonce_makes_ciphertext_unique() {
        let secret = "12345678";
        let a = encrypt_string("same text", secret).unwrap();
        let b = encrypt_string("same text", secret).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails() {
        let sealed = encrypt_string("text", "correct horse battery").unwrap();
        assert!(decrypt_string(&sealed, "wrong horse battery").is_err());
    }

    #[test]
    fn garbage_input_fails_cleanly() {
        assert!(decrypt_string("AA", "12345678").is_err());
        assert!(decrypt_string("!!!not-base64!!!", "12345678").is_err());
    }

    #[test]
    fn token_is_random() {
        assert_ne!(generate_token(), generate_token());
    }
}
