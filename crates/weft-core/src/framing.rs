//! Post-handshake stream framing.
//!
//! Every message travels as `LENGTH (2 bytes, little-endian) | PAYLOAD`.
//! The [`Deframer`] accumulates raw socket reads and yields each complete
//! frame; a single read may surface several frames, and a frame may arrive
//! across several reads.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload one frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Wrap payload bytes in a length-prefixed frame.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the payload exceeds [`MAX_FRAME_PAYLOAD`].
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .map_err(|_| Error::Parse(format!("frame payload too large: {}", payload.len())))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental frame extractor over an accumulation buffer.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: BytesMut,
}

impl Deframer {
    /// Create an empty deframer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a deframer seeded with bytes left over from the handshake.
    #[must_use]
    pub fn with_leftover(leftover: &[u8]) -> Self {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(leftover);
        Self { buf }
    }

    /// Append freshly-read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame's payload, if one is buffered.
    ///
    /// Call in a loop after each [`feed`](Self::feed) until it returns
    /// `None`; consumed bytes are trimmed from the buffer.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return None;
        }
        self.buf.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buf.split_to(len);
        Some(payload.to_vec())
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
