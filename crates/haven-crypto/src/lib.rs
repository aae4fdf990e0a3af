pub mod codec;
pub mod error;
pub mod keys;

pub use codec::{decrypt, encrypt};
pub use error::CryptoError;
pub use keys::{KdfParams, KeyManager, SALT_LEN};
