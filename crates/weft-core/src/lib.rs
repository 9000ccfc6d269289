//! # WEFT Core
//!
//! Core protocol implementation for WEFT (Wire-Efficient Frame Transport),
//! a peer-to-peer messaging substrate.
//!
//! This crate provides:
//! - Multiaddr parsing and formatting
//! - The wire message codec and length-prefixed framing
//! - Transport connections with the session-id handshake
//! - Sessions with the per-message-id in-flight call registry
//! - Declarative protocol installation with two call patterns
//!   (fire-and-forget notifications and first-responder-wins calls)
//! - Node orchestration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Node                                   │
//! │   (listeners, session table, protocol registry, message ids)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Sessions                                 │
//! │   (id-keyed channels owning the in-flight call registry)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Connections                                │
//! │   (handshake, length-prefixed frames over one TCP socket)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod message;
pub mod multiaddr;
pub mod node;
mod pattern;
pub mod payload;
pub mod protocol;
pub mod proxy;
pub mod session;

pub use config::NodeConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use message::{Message, MessageKind};
pub use multiaddr::{IpFamily, Multiaddr};
pub use node::{Node, NodeEvent};
pub use protocol::{
    protocol_tag, FirstHook, HookDef, NotifyReliableHook, Payload, ProtocolDef, ProtocolHandle,
};
pub use proxy::SessionProxy;
pub use session::{CallHandler, Session};

/// Session identifier exchanged during the handshake.
pub type SessionId = [u8; 32];

/// Handshake magic bytes.
pub const HANDSHAKE_MAGIC: [u8; 3] = [0x2A, 0x2A, 0x2A];

/// Wire protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u8 = 0x00;

/// Session identifier size in bytes.
pub const SESSION_ID_SIZE: usize = 32;

/// Server hello size: magic, version, session id, server public key.
pub const SERVER_HELLO_SIZE: usize = 68;

/// Client reply size: echoed session id, client public key.
pub const CLIENT_REPLY_SIZE: usize = 64;
