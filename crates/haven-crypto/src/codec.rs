use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Encrypt one conversational payload under a derived user key.
/// Output is base64(nonce || ciphertext || tag); the nonce is fresh per
/// call, so equal plaintexts never produce equal ciphertexts.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut framed = nonce_bytes.to_vec();
    framed.append(&mut sealed);
    Ok(BASE64.encode(framed))
}

/// Decrypt a base64 nonce + ciphertext frame. Fails closed: a tag
/// mismatch (wrong key, wrong version, tampering) yields
/// `DecryptionFailed`, never corrupted plaintext.
pub fn decrypt(encoded: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
    let framed = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidEncoding)?;
    if framed.len() <= NONCE_LEN {
        return Err(CryptoError::InvalidEncoding);
    }
    let (nonce_bytes, sealed) = framed.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let opened = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(opened).map_err(|_| CryptoError::InvalidUtf8)
}
