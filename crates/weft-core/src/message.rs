//! Wire message envelope encoding and decoding.
//!
//! Every post-handshake frame carries one message: a single kind-tag byte
//! followed by a bincode body. Tag values are fixed protocol constants;
//! reassigning one breaks wire compatibility.

use crate::error::{Error, Result};

/// Message kinds with their wire tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Liveness probe, no body
    KeepAlive = 0x00,
    /// Fire-and-forget notification over the reliable transport
    NoticeReliable = 0x10,
    /// Notification kind reserved for datagram delivery
    NoticeUnreliable = 0x11,
    /// Opens a First-pattern exchange
    PreauthReq = 0x20,
    /// Informational receipt for a preauth request
    PreauthAck = 0x21,
    /// Responder accepts; request data may flow
    PreauthAccept = 0x22,
    /// Responder (or failure path) aborts the exchange
    PreauthStop = 0x23,
    /// Request payload head chunk
    ReqData = 0x30,
    /// Request payload continuation chunk
    ReqDataCont = 0x31,
    /// Response payload head chunk
    ResData = 0x40,
    /// Response payload continuation chunk
    ResDataCont = 0x41,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::KeepAlive),
            0x10 => Ok(Self::NoticeReliable),
            0x11 => Ok(Self::NoticeUnreliable),
            0x20 => Ok(Self::PreauthReq),
            0x21 => Ok(Self::PreauthAck),
            0x22 => Ok(Self::PreauthAccept),
            0x23 => Ok(Self::PreauthStop),
            0x30 => Ok(Self::ReqData),
            0x31 => Ok(Self::ReqDataCont),
            0x40 => Ok(Self::ResData),
            0x41 => Ok(Self::ResDataCont),
            other => Err(Error::Parse(format!("unhandled message tag: 0x{other:02x}"))),
        }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe; ignored on receipt.
    KeepAlive,
    /// Fire-and-forget notification addressed to a protocol hook.
    NoticeReliable {
        /// Installed protocol tag
        protocol_tag: u32,
        /// Hook within the protocol
        hook_name: String,
        /// Encoded notification body
        payload: Vec<u8>,
    },
    /// Datagram-flavored notification; same body shape as the reliable kind.
    NoticeUnreliable {
        /// Installed protocol tag
        protocol_tag: u32,
        /// Hook within the protocol
        hook_name: String,
        /// Encoded notification body
        payload: Vec<u8>,
    },
    /// Opens a First-pattern exchange.
    PreauthReq {
        /// Correlation id shared across every destination of the call
        message_id: u64,
        /// Installed protocol tag
        protocol_tag: u32,
        /// Hook within the protocol
        hook_name: String,
        /// Encoded preauthorization body
        payload: Vec<u8>,
    },
    /// Informational receipt; initiators ignore it.
    PreauthAck {
        /// Correlation id
        message_id: u64,
    },
    /// Responder accepted the preauthorization.
    PreauthAccept {
        /// Correlation id
        message_id: u64,
    },
    /// Exchange aborted; carries the reason.
    PreauthStop {
        /// Correlation id
        message_id: u64,
        /// Human-readable failure reason
        reason: String,
    },
    /// Request payload head chunk with the declared total length.
    ReqData {
        /// Correlation id
        message_id: u64,
        /// Total request payload length across all chunks
        total_len: u32,
        /// This chunk's bytes
        chunk: Vec<u8>,
    },
    /// Request payload continuation chunk.
    ReqDataCont {
        /// Correlation id
        message_id: u64,
        /// This chunk's bytes
        chunk: Vec<u8>,
    },
    /// Response payload head chunk with the declared total length.
    ResData {
        /// Correlation id
        message_id: u64,
        /// Total response payload length across all chunks
        total_len: u32,
        /// This chunk's bytes
        chunk: Vec<u8>,
    },
    /// Response payload continuation chunk.
    ResDataCont {
        /// Correlation id
        message_id: u64,
        /// This chunk's bytes
        chunk: Vec<u8>,
    },
}

impl Message {
    /// The kind tag of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::KeepAlive => MessageKind::KeepAlive,
            Self::NoticeReliable { .. } => MessageKind::NoticeReliable,
            Self::NoticeUnreliable { .. } => MessageKind::NoticeUnreliable,
            Self::PreauthReq { .. } => MessageKind::PreauthReq,
            Self::PreauthAck { .. } => MessageKind::PreauthAck,
            Self::PreauthAccept { .. } => MessageKind::PreauthAccept,
            Self::PreauthStop { .. } => MessageKind::PreauthStop,
            Self::ReqData { .. } => MessageKind::ReqData,
            Self::ReqDataCont { .. } => MessageKind::ReqDataCont,
            Self::ResData { .. } => MessageKind::ResData,
            Self::ResDataCont { .. } => MessageKind::ResDataCont,
        }
    }

    /// The correlation id, for the kinds that carry one.
    #[must_use]
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Self::KeepAlive | Self::NoticeReliable { .. } | Self::NoticeUnreliable { .. } => None,
            Self::PreauthReq { message_id, .. }
            | Self::PreauthAck { message_id }
            | Self::PreauthAccept { message_id }
            | Self::PreauthStop { message_id, .. }
            | Self::ReqData { message_id, .. }
            | Self::ReqDataCont { message_id, .. }
            | Self::ResData { message_id, .. }
            | Self::ResDataCont { message_id, .. } => Some(*message_id),
        }
    }

    /// Whether this kind opens a call (dispatched through the node's
    /// protocol registry rather than a session's in-flight table).
    #[must_use]
    pub fn is_call_initiating(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::NoticeReliable | MessageKind::NoticeUnreliable | MessageKind::PreauthReq
        )
    }

    /// Encode into envelope bytes: kind tag, then the bincode body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the body cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Self::KeepAlive => Vec::new(),
            Self::NoticeReliable {
                protocol_tag,
                hook_name,
                payload,
            }
            | Self::NoticeUnreliable {
                protocol_tag,
                hook_name,
                payload,
            } => body(&(protocol_tag, hook_name, payload))?,
            Self::PreauthReq {
                message_id,
                protocol_tag,
                hook_name,
                payload,
            } => body(&(message_id, protocol_tag, hook_name, payload))?,
            Self::PreauthAck { message_id } | Self::PreauthAccept { message_id } => {
                body(&message_id)?
            }
            Self::PreauthStop { message_id, reason } => body(&(message_id, reason))?,
            Self::ReqData {
                message_id,
                total_len,
                chunk,
            }
            | Self::ResData {
                message_id,
                total_len,
                chunk,
            } => body(&(message_id, total_len, chunk))?,
            Self::ReqDataCont { message_id, chunk } | Self::ResDataCont { message_id, chunk } => {
                body(&(message_id, chunk))?
            }
        };

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode envelope bytes produced by [`Message::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] on an empty buffer, unknown kind tag, or
    /// malformed body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Parse("empty message".into()))?;

        Ok(match MessageKind::try_from(tag)? {
            MessageKind::KeepAlive => Self::KeepAlive,
            MessageKind::NoticeReliable => {
                let (protocol_tag, hook_name, payload) = parse(rest)?;
                Self::NoticeReliable {
                    protocol_tag,
                    hook_name,
                    payload,
                }
            }
            MessageKind::NoticeUnreliable => {
                let (protocol_tag, hook_name, payload) = parse(rest)?;
                Self::NoticeUnreliable {
                    protocol_tag,
                    hook_name,
                    payload,
                }
            }
            MessageKind::PreauthReq => {
                let (message_id, protocol_tag, hook_name, payload) = parse(rest)?;
                Self::PreauthReq {
                    message_id,
                    protocol_tag,
                    hook_name,
                    payload,
                }
            }
            MessageKind::PreauthAck => Self::PreauthAck {
                message_id: parse(rest)?,
            },
            MessageKind::PreauthAccept => Self::PreauthAccept {
                message_id: parse(rest)?,
            },
            MessageKind::PreauthStop => {
                let (message_id, reason) = parse(rest)?;
                Self::PreauthStop { message_id, reason }
            }
            MessageKind::ReqData => {
                let (message_id, total_len, chunk) = parse(rest)?;
                Self::ReqData {
                    message_id,
                    total_len,
                    chunk,
                }
            }
            MessageKind::ReqDataCont => {
                let (message_id, chunk) = parse(rest)?;
                Self::ReqDataCont { message_id, chunk }
            }
            MessageKind::ResData => {
                let (message_id, total_len, chunk) = parse(rest)?;
                Self::ResData {
                    message_id,
                    total_len,
                    chunk,
                }
            }
            MessageKind::ResDataCont => {
                let (message_id, chunk) = parse(rest)?;
                Self::ResDataCont { message_id, chunk }
            }
        })
    }
}

fn body<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Parse(e.to_string()))
}

fn parse<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Parse(e.to_string()))
}
