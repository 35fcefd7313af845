//! Persistent storage for registry identity tokens.
//!
//! A [`TokenStore`] fronts one of three secrets backends with an in-memory
//! read-through cache and a revocation list:
//!
//! - [`PassVault`]: entries in the `pass` password manager, one subprocess
//!   call per operation
//! - [`PlaintextVault`]: JSON files on disk, opt-in via
//!   `GORDON_ALLOW_UNSAFE_SECRETS=true`
//! - sops: contract only, construction fails until implemented

mod pass;
mod plaintext;
mod record;
mod sops;
mod store;
mod subject;

pub use pass::PassVault;
pub use plaintext::PlaintextVault;
pub use record::TokenRecord;
pub use store::{SecretsBackend, SecretsBackendKind, TokenStore, open_backend};
pub use subject::validate_subject;

/// Errors from token store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("No token stored for subject: {0}")]
    NotFound(String),

    #[error("No token with ID: {0}")]
    UnknownTokenId(String),

    #[error("Secrets backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend operation failed: {0}")]
    Backend(String),

    #[error("Backend operation timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
