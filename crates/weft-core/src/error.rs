//! Error types for the WEFT core protocol.

use std::borrow::Cow;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed multiaddr or wire message
    #[error("parse error: {0}")]
    Parse(String),

    /// Handshake failure: bad magic/version, short read, or timeout
    #[error("handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Unexpected message kind for the current state, unregistered message
    /// id, or unknown protocol tag or hook
    #[error("protocol violation: {0}")]
    Violation(Cow<'static, str>),

    /// A hook callback failed; for First-pattern calls the reason travels to
    /// the peer as a `preauthStop`
    #[error("application error: {0}")]
    Application(String),

    /// Two installed protocols hash to the same integer tag
    #[error("protocol tag collision: 0x{0:08x}")]
    TagCollision(u32),

    /// A session proxy that resolves to no live session
    #[error("unknown or closed session")]
    NotFound,

    /// Operation on a closed connection, session, or node
    #[error("closed")]
    Closed,

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside the crypto provider
    #[error("crypto error: {0}")]
    Crypto(#[from] weft_crypto::CryptoError),
}

impl Error {
    /// Build a [`Error::Violation`] from a static description.
    #[must_use]
    pub fn violation(what: &'static str) -> Self {
        Self::Violation(Cow::Borrowed(what))
    }
}
