//! # WEFT Crypto
//!
//! Cryptographic primitives for the WEFT protocol.
//!
//! This crate provides:
//! - SHA-256 / SHA-512 hashing
//! - Secure random number generation
//! - X25519 key exchange with directional session-key derivation
//! - Zeroizing secret-buffer custody
//!
//! The protocol core consumes these through the types re-exported here; it
//! never touches raw key material outside a [`SecretBuf`] scope.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod hash;
pub mod kx;
pub mod random;
pub mod secret;

pub use error::CryptoError;
pub use kx::{Keypair, PublicKey, SessionKeys};
pub use secret::SecretBuf;

/// X25519 public key size
pub const KX_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const KX_SECRET_KEY_SIZE: usize = 32;

/// Derived session key size (each of rx and tx)
pub const KX_SESSION_KEY_SIZE: usize = 32;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;

/// SHA-512 output size
pub const SHA512_OUTPUT_SIZE: usize = 64;
