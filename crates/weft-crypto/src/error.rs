//! Error types for WEFT cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// OS CSPRNG failure
    #[error("random number generation failed")]
    RandomFailed,

    /// Peer public key is a low-order point
    #[error("weak peer public key rejected")]
    WeakPublicKey,

    /// Secret buffer length does not match the operation's requirement
    #[error("bad secret length: expected {expected}, got {actual}")]
    BadSecretLength {
        /// Required length in bytes
        expected: usize,
        /// Actual buffer length
        actual: usize,
    },
}
