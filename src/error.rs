//! Error types for the paychain harness.
//!
//! Every failure is a synchronous return at the point of detection; nothing
//! is retried internally. Callers should treat any of these as fatal to the
//! current operation and retry only after correcting input.

use openssl::error::ErrorStack;
use thiserror::Error;

/// Result type alias for paychain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The certificate-chain tier an error refers to.
///
/// Validation errors name the offending tier so a test harness can localize
/// failures without re-running the whole chain check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Ca,
    Intermediate,
    Leaf,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Ca => write!(f, "ca"),
            Tier::Intermediate => write!(f, "intermediate"),
            Tier::Leaf => write!(f, "leaf"),
        }
    }
}

/// Errors that can occur in the paychain harness.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A private key does not correspond to a certificate's embedded public key.
    #[error("{0} private key not valid for {0} certificate")]
    KeyMismatch(Tier),

    /// A certificate's signature does not verify against its claimed issuer.
    #[error("{0} certificate not verified by its issuer")]
    ChainVerification(Tier),

    /// Operation attempted on a token or authority missing a required prior step.
    #[error("protocol state: {0}")]
    ProtocolState(String),

    /// Underlying OpenSSL failure.
    #[error("openssl: {0}")]
    Openssl(#[from] ErrorStack),

    /// Wire (de)serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
