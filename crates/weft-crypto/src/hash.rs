//! SHA-2 hashing.
//!
//! Fixed-output helpers over the `sha2` crate. Protocol identity tags and
//! session-key derivation both build on these.

use sha2::{Digest, Sha256, Sha512};

/// SHA-256 output (32 bytes).
pub type Sha256Output = [u8; 32];

/// SHA-512 output (64 bytes).
pub type Sha512Output = [u8; 64];

/// Compute the SHA-256 hash of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> Sha256Output {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Compute the SHA-512 hash of `data`.
#[must_use]
pub fn sha512(data: &[u8]) -> Sha512Output {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Vectors match `printf yo | sha256sum` / `sha512sum`.
    #[test]
    fn sha256_vector() {
        assert_eq!(
            hex::encode(sha256(b"yo")),
            "e9058ab198f6908f702111b0c0fb5b36f99d00554521886c40e2891b349dc7a1"
        );
    }

    #[test]
    fn sha512_vector() {
        assert_eq!(
            hex::encode(sha512(b"yo")),
            "74c47decc64fd921299567f5f6467860dc9179ce2e723048c184fdf2fd6a3293\
             6470ecc3d639b6947e99f9c42735ed20552be14fda24084ad79627195aca3fb1"
        );
    }

    #[test]
    fn outputs_differ_per_input() {
        assert_ne!(sha256(b"a"), sha256(b"b"));
        assert_ne!(sha512(b"a")[..32], sha512(b"b")[..32]);
    }
}
