//! Error types for ledger persistence and verification

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Genesis block has not been registered")]
    GenesisBlockNotRegistered,

    #[error("Verification failed: {0}")]
    Verify(String),

    #[error("Witness does not match the hash it is meant to verify")]
    WitnessVerify,

    #[error("Script verification failed: {0}")]
    ScriptVerify(String),

    #[error("Unknown verification failure: {0}")]
    UnknownVerify(String),

    #[error("Coin is not spent")]
    CoinUnspent,

    #[error("Coin has already been claimed")]
    CoinClaimed,

    #[error("Invalid claim")]
    InvalidClaim,

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Attempted to add an already existing object for key {kind}:{key}")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("VM execution failed: {0}")]
    Vm(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Blockchain stopped before the block was persisted")]
    Stopped,
}

impl LedgerError {
    /// Whether this failure was raised by a verification rule
    pub fn is_verify_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Verify(_)
                | LedgerError::WitnessVerify
                | LedgerError::ScriptVerify(_)
                | LedgerError::UnknownVerify(_)
                | LedgerError::CoinUnspent
                | LedgerError::CoinClaimed
                | LedgerError::InvalidClaim
        )
    }

    /// Keep verification failures, wrap anything else as `UnknownVerify`
    pub fn into_verify_error(self) -> LedgerError {
        if self.is_verify_error() {
            self
        } else {
            LedgerError::UnknownVerify(self.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_verify_error() {
        let wrapped = LedgerError::Storage("disk gone".into()).into_verify_error();
        assert!(matches!(wrapped, LedgerError::UnknownVerify(ref m) if m.contains("disk gone")));
        assert!(matches!(LedgerError::CoinClaimed.into_verify_error(), LedgerError::CoinClaimed));
    }

    #[test]
    fn test_already_exists_message() {
        let err = LedgerError::AlreadyExists { kind: "account", key: "ab".to_string() };
        assert_eq!(
            err.to_string(),
            "Attempted to add an already existing object for key account:ab"
        );
    }

    #[test]
    fn test_verify_classification() {
        assert!(LedgerError::ScriptVerify("x".into()).is_verify_error());
        assert!(LedgerError::CoinClaimed.is_verify_error());
        assert!(!LedgerError::Storage("disk".into()).is_verify_error());
        assert!(!LedgerError::GenesisBlockNotRegistered.is_verify_error());
    }
}
