use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error suitable for machine-readable CLI output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Render any report, keeping the stable code when the root cause is a [`KeyringError`].
    pub fn from_report(report: &eyre::Report) -> Self {
        report.downcast_ref::<KeyringError>().map_or_else(
            || Self::new("internal", format!("{report:#}")),
            |e| e.clone().into(),
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyringError {
    #[error("key ring is not loaded")]
    NotLoaded,

    #[error("key ring is empty")]
    NoKeyRing,

    #[error("key ring is not empty")]
    NotEmpty,

    #[error("key ring is locked")]
    Locked,

    #[error("invalid password")]
    WrongPassword,

    #[error("signer mismatched: expected {expected}, got {actual}")]
    SignerMismatch { expected: String, actual: String },

    #[error("unmatched signer in sign doc")]
    UnmatchedSignerInSignDoc,

    #[error("unmatched signer in approved sign doc")]
    UnmatchedSignerInApprovedSignDoc,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("sign doc classification changed during approval")]
    ClassificationChanged,

    #[error("key store index out of range: {0}")]
    IndexOutOfRange(usize),

    #[error("invalid secret material: {0}")]
    InvalidSecretMaterial(String),

    #[error("unsupported pub key type: {0}")]
    UnsupportedPubKeyType(String),

    #[error("request rejected")]
    ApprovalRejected,

    #[error("derivation failure: {0}")]
    DerivationFailure(String),

    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error("invalid sign doc: {0}")]
    InvalidSignDoc(String),

    #[error("coin type {coin_type} is not offered by chain {chain_id}")]
    UnsupportedCoinType { chain_id: String, coin_type: u32 },

    #[error("approval returned a response for a different request kind")]
    InvalidApprovalResponse,

    #[error("hardware signer unavailable")]
    HardwareUnavailable,

    #[error("rpc transport: {0}")]
    Transport(String),

    #[error("keystore busy")]
    KeystoreBusy,
}

impl From<KeyringError> for ErrorBody {
    fn from(e: KeyringError) -> Self {
        let code = match &e {
            KeyringError::NotLoaded => "not_loaded",
            KeyringError::NoKeyRing => "no_key_ring",
            KeyringError::NotEmpty => "not_empty",
            KeyringError::Locked => "locked",
            KeyringError::WrongPassword => "wrong_password",
            KeyringError::SignerMismatch { .. } => "signer_mismatch",
            KeyringError::UnmatchedSignerInSignDoc => "unmatched_signer_in_sign_doc",
            KeyringError::UnmatchedSignerInApprovedSignDoc => {
                "unmatched_signer_in_approved_sign_doc"
            }
            KeyringError::InvalidOption(_) => "invalid_option",
            KeyringError::ClassificationChanged => "classification_changed",
            KeyringError::IndexOutOfRange(_) => "index_out_of_range",
            KeyringError::InvalidSecretMaterial(_) => "invalid_secret_material",
            KeyringError::UnsupportedPubKeyType(_) => "unsupported_pub_key_type",
            KeyringError::ApprovalRejected => "approval_rejected",
            KeyringError::DerivationFailure(_) => "derivation_failure",
            KeyringError::UnknownChain(_) => "unknown_chain",
            KeyringError::InvalidSignDoc(_) => "invalid_sign_doc",
            KeyringError::UnsupportedCoinType { .. } => "unsupported_coin_type",
            KeyringError::InvalidApprovalResponse => "invalid_approval_response",
            KeyringError::HardwareUnavailable => "hardware_unavailable",
            KeyringError::Transport(_) => "transport",
            KeyringError::KeystoreBusy => "keystore_busy",
        };
        Self::new(code, e.to_string())
    }
}

/// Returns the typed keyring error carried by `report`, if any.
pub fn keyring_error(report: &eyre::Report) -> Option<&KeyringError> {
    report.downcast_ref::<KeyringError>()
}
