//! Passphrase envelope encryption
//!
//! A blob is sealed as a unit under a key derived from a passphrase with
//! Argon2id and encrypted with AES-256-GCM. The encoded form is standard
//! base64 of:
//!
//! ```text
//! version (1) || salt (16) || nonce (12) || ciphertext || tag (16)
//! ```
//!
//! The version byte and salt are authenticated as associated data, so any
//! modification of the header is reported the same way as a wrong passphrase.

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use certwarden_config::Passphrase;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use super::error::CryptoError;

const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + SALT_LEN;

/// Encrypt `plaintext` under `passphrase`.
pub fn encrypt(plaintext: &[u8], passphrase: &Passphrase) -> Result<String, CryptoError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| CryptoError::Encryption("no entropy for salt".to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce)
        .map_err(|_| CryptoError::Encryption("no entropy for nonce".to_string()))?;

    let key = derive_key(passphrase, &salt)?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + plaintext.len() + TAG_LEN);
    out.push(VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(&out[..HEADER_LEN]),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Encryption("AES-GCM seal failed".to_string()))?;
    out.extend_from_slice(&in_out);

    Ok(STANDARD.encode(out))
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Returns [`CryptoError::Malformed`] when the input cannot be a blob at all
/// and [`CryptoError::Authentication`] when it is well-formed but does not
/// open under `passphrase`.
pub fn decrypt(blob: &str, passphrase: &Passphrase) -> Result<Vec<u8>, CryptoError> {
    let raw = STANDARD
        .decode(blob.trim().as_bytes())
        .map_err(|e| CryptoError::Malformed(format!("invalid base64: {}", e)))?;

    if raw.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "blob too short ({} bytes)",
            raw.len()
        )));
    }
    if raw[0] != VERSION {
        return Err(CryptoError::Malformed(format!(
            "unsupported blob version {}",
            raw[0]
        )));
    }

    let (header, rest) = raw.split_at(HEADER_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let salt = &header[1..];

    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| CryptoError::Malformed("invalid nonce".to_string()))?;
    let key = derive_key(passphrase, salt)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from(header), &mut in_out)
        .map_err(|_| CryptoError::Authentication)?;

    Ok(plaintext.to_vec())
}

fn derive_key(passphrase: &Passphrase, salt: &[u8]) -> Result<LessSafeKey, CryptoError> {
    let mut key_bytes = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| CryptoError::Encryption(format!("key derivation failed: {}", e)))?;

    let key = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| CryptoError::Encryption("invalid AES-256 key".to_string()))?;
    Ok(LessSafeKey::new(key))
}
