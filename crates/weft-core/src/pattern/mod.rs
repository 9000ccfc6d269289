//! Call pattern engines.
//!
//! Each installed hook is served by one of two engines: [`notify`] for
//! fire-and-forget reliable notifications, [`first`] for the preauthorized
//! first-responder-wins exchange. Both directions of bulk data share the
//! chunking scheme here: a payload fitting one chunk travels as a single
//! head frame; anything larger is a head frame plus continuations,
//! reassembled against the declared total length.

pub(crate) mod first;
pub(crate) mod notify;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::session::Session;

/// Which message kinds a chunked transfer uses.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DataDirection {
    /// `reqData` / `reqDataCont`, initiator to responder
    Request,
    /// `resData` / `resDataCont`, responder to initiator
    Response,
}

impl DataDirection {
    fn head(self, message_id: u64, total_len: u32, chunk: Vec<u8>) -> Message {
        match self {
            Self::Request => Message::ReqData {
                message_id,
                total_len,
                chunk,
            },
            Self::Response => Message::ResData {
                message_id,
                total_len,
                chunk,
            },
        }
    }

    fn cont(self, message_id: u64, chunk: Vec<u8>) -> Message {
        match self {
            Self::Request => Message::ReqDataCont { message_id, chunk },
            Self::Response => Message::ResDataCont { message_id, chunk },
        }
    }
}

/// Send `payload` as one head frame plus however many continuations the
/// chunk budget requires.
pub(crate) async fn send_chunked(
    session: &Session,
    direction: DataDirection,
    message_id: u64,
    payload: &[u8],
    max_chunk: usize,
) -> Result<()> {
    let total_len = u32::try_from(payload.len())
        .map_err(|_| Error::Parse(format!("payload too large: {}", payload.len())))?;

    let head_len = payload.len().min(max_chunk);
    session
        .send(&direction.head(message_id, total_len, payload[..head_len].to_vec()))
        .await?;

    let mut offset = head_len;
    while offset < payload.len() {
        let end = (offset + max_chunk).min(payload.len());
        session
            .send(&direction.cont(message_id, payload[offset..end].to_vec()))
            .await?;
        offset = end;
    }
    Ok(())
}

/// Receiver-side accumulation of a chunked transfer.
///
/// Feed the head and continuation chunks in arrival order; the reassembled
/// buffer is handed out exactly once, when the running total reaches the
/// declared length.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    total: Option<usize>,
    buf: Vec<u8>,
}

impl Reassembly {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept the head chunk with its declared total length.
    pub(crate) fn head(&mut self, total_len: u32, chunk: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.total.is_some() {
            return Err(Error::violation("duplicate data head frame"));
        }
        self.total = Some(total_len as usize);
        self.buf = chunk;
        self.check_complete()
    }

    /// Accept a continuation chunk.
    pub(crate) fn cont(&mut self, chunk: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.total.is_none() {
            return Err(Error::violation("continuation frame before head frame"));
        }
        self.buf.extend_from_slice(&chunk);
        self.check_complete()
    }

    fn check_complete(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(total) = self.total else {
            return Ok(None);
        };
        match self.buf.len().cmp(&total) {
            std::cmp::Ordering::Less => Ok(None),
            std::cmp::Ordering::Equal => {
                self.total = None;
                Ok(Some(std::mem::take(&mut self.buf)))
            }
            std::cmp::Ordering::Greater => {
                Err(Error::violation("data exceeds declared total length"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(payload: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
        // Mirror of send_chunked's slicing, without a socket.
        let mut out = vec![payload[..payload.len().min(max_chunk)].to_vec()];
        let mut offset = out[0].len();
        while offset < payload.len() {
            let end = (offset + max_chunk).min(payload.len());
            out.push(payload[offset..end].to_vec());
            offset = end;
        }
        out
    }

    fn reassemble(payload: &[u8], max_chunk: usize) -> Vec<u8> {
        let mut re = Reassembly::new();
        let mut parts = chunks(payload, max_chunk).into_iter();
        let head = parts.next().unwrap();
        if let Some(done) = re.head(payload.len() as u32, head).unwrap() {
            assert_eq!(parts.next(), None);
            return done;
        }
        for part in parts {
            if let Some(done) = re.cont(part).unwrap() {
                return done;
            }
        }
        panic!("transfer never completed");
    }

    #[test]
    fn round_trips_empty_single_and_multi_chunk() {
        assert_eq!(reassemble(b"", 8), b"");
        assert_eq!(reassemble(b"x", 8), b"x");
        assert_eq!(reassemble(b"exactly8", 8), b"exactly8");
        let big: Vec<u8> = (0..100u8).cycle().take(1000).collect();
        assert_eq!(reassemble(&big, 64), big);
    }

    #[test]
    fn delivers_exactly_once() {
        let mut re = Reassembly::new();
        assert_eq!(re.head(2, vec![1]).unwrap(), None);
        assert_eq!(re.cont(vec![2]).unwrap(), Some(vec![1, 2]));
        // A stray continuation after delivery is a violation, not a second
        // delivery.
        assert!(re.cont(vec![3]).is_err());
    }

    #[test]
    fn rejects_protocol_abuse() {
        let mut re = Reassembly::new();
        assert!(re.cont(vec![0]).is_err());

        let mut re = Reassembly::new();
        assert_eq!(re.head(10, vec![0; 4]).unwrap(), None);
        assert!(re.head(10, vec![0; 4]).is_err());

        let mut re = Reassembly::new();
        assert!(re.head(2, vec![0; 5]).is_err());
    }
}
