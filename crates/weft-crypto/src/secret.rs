//! Zeroizing secret-buffer custody.
//!
//! [`SecretBuf`] is the only container the rest of the workspace uses for key
//! material. Access is scoped: callers borrow the bytes for one closure and
//! the buffer is wiped when dropped. OS-level page protection is not part of
//! the contract.

use zeroize::Zeroize;

use crate::random;
use crate::CryptoError;

/// A heap buffer holding secret bytes, zeroized on drop.
pub struct SecretBuf {
    data: Box<[u8]>,
}

impl SecretBuf {
    /// Allocate a zero-filled secret buffer of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Copy `bytes` into a fresh secret buffer.
    ///
    /// The caller still owns (and should wipe) the source.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite the buffer with fresh OS randomness.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn randomize(&mut self) -> Result<(), CryptoError> {
        random::fill(&mut self.data)
    }

    /// Borrow the secret bytes read-only for the duration of `f`.
    pub fn read_with<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.data)
    }

    /// Borrow the secret bytes mutably for the duration of `f`.
    pub fn write_with<T>(&mut self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        f(&mut self.data)
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl Clone for SecretBuf {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.data)
    }
}

impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuf({} bytes, redacted)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_read_and_write() {
        let mut buf = SecretBuf::new(4);
        buf.write_with(|b| b.copy_from_slice(&[1, 2, 3, 4]));
        assert_eq!(buf.read_with(|b| b.to_vec()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn randomize_changes_contents() {
        let mut buf = SecretBuf::new(32);
        buf.randomize().unwrap();
        assert!(buf.read_with(|b| b.iter().any(|&x| x != 0)));
    }

    #[test]
    fn debug_redacts() {
        let mut buf = SecretBuf::from_bytes(&[0xAA; 8]);
        buf.write_with(|b| b[0] = 0x55);
        let rendered = format!("{buf:?}");
        assert!(!rendered.contains("55"));
        assert!(!rendered.contains("aa"));
        assert!(rendered.contains("8 bytes"));
    }
}
