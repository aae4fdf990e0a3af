#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    /// Authentication tag mismatch: wrong key, wrong version, or tampered
    /// ciphertext. The entry is unreadable; plaintext is never guessed.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid encoding")]
    InvalidEncoding,

    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// No salt on record for this user; the key cannot be derived. Fatal
    /// for this user's operations only.
    #[error("missing key material for user {0}")]
    MissingKeyMaterial(String),
}
