use crate::token::{ObjectClass, SlotId, TokenError};
use std::path::PathBuf;
use thiserror::Error;

/// Which cryptographic step a [`EnvelopeError::Crypto`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOp {
    WrapInit,
    Wrap,
    UnwrapInit,
    Unwrap,
}

impl std::fmt::Display for CryptoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CryptoOp::WrapInit => "wrap init",
            CryptoOp::Wrap => "wrap",
            CryptoOp::UnwrapInit => "unwrap init",
            CryptoOp::Unwrap => "unwrap",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("secure element runtime failed to initialize")]
    Runtime(#[source] TokenError),

    #[error("cannot connect to slot {slot}")]
    Connection { slot: SlotId, source: TokenError },

    #[error("credential rejected")]
    Auth(#[source] TokenError),

    #[error("{class} object not found: {label}")]
    NotFound { class: ObjectClass, label: String },

    #[error("{op} rejected by the secure element")]
    Crypto { op: CryptoOp, source: TokenError },

    #[error("wrapped data rejected on unwrap (padding or length invalid)")]
    Integrity(#[source] TokenError),

    #[error("cannot create data object {label}")]
    Create { label: String, source: TokenError },

    #[error("{op} failed")]
    Store { op: &'static str, source: TokenError },

    #[error("cannot read DEK file {}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settings: {0}")]
    Settings(String),
}

impl EnvelopeError {
    /// True for failures of the credential itself, as opposed to the device or the data.
    pub fn is_auth(&self) -> bool {
        matches!(self, EnvelopeError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
