use haven_core::errors::AgentError;
use haven_crypto::CryptoError;
use haven_store::StoreError;

use crate::session::InvalidTransition;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// A scheduling or logic defect: the trigger does not apply to the
    /// session's current state. Surfaced loudly, state left untouched.
    #[error("invalid session transition: {0}")]
    InvalidStateTransition(#[from] InvalidTransition),

    #[error("no open session for chat {0}")]
    NoOpenSession(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Fatal errors are scoped to one user or chat; they never take down
    /// processing for others.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Crypto(CryptoError::MissingKeyMaterial(_)) => "missing_key_material",
            Self::Crypto(CryptoError::DecryptionFailed) => "decryption_failed",
            Self::Crypto(_) => "crypto",
            Self::Agent(_) => "agent",
            Self::InvalidStateTransition(_) => "invalid_state_transition",
            Self::NoOpenSession(_) => "no_open_session",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_classification() {
        let e = EngineError::Crypto(CryptoError::MissingKeyMaterial("user_x".into()));
        assert_eq!(e.error_kind(), "missing_key_material");

        let e = EngineError::Crypto(CryptoError::DecryptionFailed);
        assert_eq!(e.error_kind(), "decryption_failed");

        let e = EngineError::NoOpenSession("chat_x".into());
        assert_eq!(e.error_kind(), "no_open_session");
    }
}
