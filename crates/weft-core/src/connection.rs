//! Transport connections: handshake and stream framing.
//!
//! A [`Connection`] owns one TCP socket exclusively. Construction runs the
//! handshake, so a value you can hold is already `Established`; the state
//! machine is `Connecting -> Handshaking -> Established -> Closed`, with any
//! failure short-circuiting to `Closed`.
//!
//! Handshake wire sequence:
//!
//! ```text
//! server -> client   MAGIC(3) | VERSION(1) | SESSION_ID(32) | SERVER_KX_PUB(32)
//! client -> server   SESSION_ID(32, echoed) | CLIENT_KX_PUB(32)
//! ```
//!
//! Both sides then derive directional session keys and adopt the session id
//! as the connection's identity. Bytes a peer sends past the fixed prefix
//! belong to the first frame and are carried into the deframer, never
//! dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use weft_crypto::kx::{self, Keypair, PublicKey, SessionKeys};
use weft_crypto::random;

use crate::error::{Error, Result};
use crate::framing;
use crate::message::Message;
use crate::multiaddr::Multiaddr;
use crate::{SessionId, CLIENT_REPLY_SIZE, HANDSHAKE_MAGIC, PROTOCOL_VERSION, SERVER_HELLO_SIZE};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the peer
    Connecting,
    /// Socket up, handshake bytes in flight
    Handshaking,
    /// Handshake complete, frames flowing
    Established,
    /// Terminal; the socket is gone
    Closed,
}

fn transition(from: ConnectionState, to: ConnectionState) {
    tracing::debug!(?from, ?to, "connection state");
}

/// One authenticated transport connection.
pub struct Connection {
    session_id: SessionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    keys: SessionKeys,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: std::sync::Mutex<Option<ReaderHalf>>,
    closed: AtomicBool,
}

/// Read half plus any post-handshake bytes already pulled off the socket.
pub(crate) struct ReaderHalf {
    pub(crate) read: OwnedReadHalf,
    pub(crate) leftover: Vec<u8>,
}

struct HandshakeOutcome {
    session_id: SessionId,
    keys: SessionKeys,
    leftover: Vec<u8>,
}

impl Connection {
    /// Dial `ma` and run the client side of the handshake.
    ///
    /// One `timeout` bounds connect and handshake together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the multiaddr lacks a host or TCP port,
    /// and [`Error::Handshake`] on timeout, bad magic/version, or a peer
    /// that hangs up mid-handshake.
    pub async fn connect(ma: &Multiaddr, keypair: &Keypair, timeout: Duration) -> Result<Arc<Self>> {
        let (Some(host), Some(port)) = (ma.host(), ma.tcp_port()) else {
            return Err(Error::Parse(format!("multiaddr missing host or tcp port: {ma}")));
        };

        transition(ConnectionState::Connecting, ConnectionState::Handshaking);
        let setup = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            let outcome = client_handshake(&mut stream, keypair).await?;
            Ok::<_, Error>((stream, outcome))
        };
        let (stream, outcome) = tokio::time::timeout(timeout, setup)
            .await
            .map_err(|_| Error::Handshake("timeout during connect/handshake".into()))??;

        Self::established(stream, outcome)
    }

    /// Run the server side of the handshake on an accepted socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] on timeout or a peer that hangs up
    /// mid-handshake.
    pub async fn accept(stream: TcpStream, keypair: &Keypair, timeout: Duration) -> Result<Arc<Self>> {
        transition(ConnectionState::Connecting, ConnectionState::Handshaking);
        let mut stream = stream;
        let outcome = tokio::time::timeout(timeout, server_handshake(&mut stream, keypair))
            .await
            .map_err(|_| Error::Handshake("timeout during handshake".into()))??;

        Self::established(stream, outcome)
    }

    fn established(stream: TcpStream, outcome: HandshakeOutcome) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read, write) = stream.into_split();

        transition(ConnectionState::Handshaking, ConnectionState::Established);
        tracing::debug!(
            session = %hex::encode(&outcome.session_id[..8]),
            peer = %peer_addr,
            "connection established"
        );

        Ok(Arc::new(Self {
            session_id: outcome.session_id,
            peer_addr,
            local_addr,
            keys: outcome.keys,
            writer: tokio::sync::Mutex::new(Some(write)),
            reader: std::sync::Mutex::new(Some(ReaderHalf {
                read,
                leftover: outcome.leftover,
            })),
            closed: AtomicBool::new(false),
        }))
    }

    /// The session id adopted during the handshake.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Remote socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session keys derived from the handshake. Held for the connection's
    /// lifetime; this protocol version encrypts nothing with them.
    #[must_use]
    pub fn session_keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else {
            ConnectionState::Established
        }
    }

    /// Take the read half for the session's reader task. Yields once.
    pub(crate) fn take_reader(&self) -> Option<ReaderHalf> {
        self.reader.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Frame-encode and write one message.
    ///
    /// Writes are serialized in lock-acquisition order; there is no
    /// payload-level backpressure beyond the OS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close), or the
    /// underlying I/O error.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let bytes = framing::frame(&msg.encode()?)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Destroy the socket. Idempotent; later sends fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        transition(ConnectionState::Established, ConnectionState::Closed);

        if let Ok(mut guard) = self.reader.lock() {
            guard.take();
        }
        // A send in flight finishes with its write half; the socket then
        // closes when the last half drops.
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &hex::encode(&self.session_id[..8]))
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Accumulate reads until `buf` holds at least `want` bytes.
async fn read_at_least(stream: &mut TcpStream, buf: &mut Vec<u8>, want: usize) -> Result<()> {
    let mut tmp = [0u8; 1024];
    while buf.len() < want {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::Handshake("peer closed during handshake".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(())
}

async fn client_handshake(stream: &mut TcpStream, keypair: &Keypair) -> Result<HandshakeOutcome> {
    let mut buf = Vec::with_capacity(SERVER_HELLO_SIZE);
    read_at_least(stream, &mut buf, SERVER_HELLO_SIZE).await?;

    if buf[..3] != HANDSHAKE_MAGIC || buf[3] != PROTOCOL_VERSION {
        return Err(Error::Handshake("invalid magic or protocol version".into()));
    }

    let mut session_id: SessionId = [0u8; 32];
    session_id.copy_from_slice(&buf[4..36]);
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&buf[36..SERVER_HELLO_SIZE]);

    let keys = kx::client_session(keypair, &PublicKey::from_bytes(server_public))?;

    stream.write_all(&session_id).await?;
    stream.write_all(keypair.public.as_bytes()).await?;

    Ok(HandshakeOutcome {
        session_id,
        keys,
        leftover: buf.split_off(SERVER_HELLO_SIZE),
    })
}

async fn server_handshake(stream: &mut TcpStream, keypair: &Keypair) -> Result<HandshakeOutcome> {
    let generated_id = random::random_32()?;

    let mut hello = Vec::with_capacity(SERVER_HELLO_SIZE);
    hello.extend_from_slice(&HANDSHAKE_MAGIC);
    hello.push(PROTOCOL_VERSION);
    hello.extend_from_slice(&generated_id);
    hello.extend_from_slice(keypair.public.as_bytes());
    stream.write_all(&hello).await?;

    let mut buf = Vec::with_capacity(CLIENT_REPLY_SIZE);
    read_at_least(stream, &mut buf, CLIENT_REPLY_SIZE).await?;

    // The echoed id is adopted as-is, without comparing it to the id
    // generated above.
    let mut session_id: SessionId = [0u8; 32];
    session_id.copy_from_slice(&buf[..32]);
    let mut client_public = [0u8; 32];
    client_public.copy_from_slice(&buf[32..CLIENT_REPLY_SIZE]);

    let keys = kx::server_session(keypair, &PublicKey::from_bytes(client_public))?;

    Ok(HandshakeOutcome {
        session_id,
        keys,
        leftover: buf.split_off(CLIENT_REPLY_SIZE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Deframer;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_kp = Keypair::generate().unwrap();
        let client_kp = Keypair::generate().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &server_kp, TIMEOUT).await.unwrap()
        });

        let ma: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        let client = Connection::connect(&ma, &client_kp, TIMEOUT).await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn handshake_agrees_on_session_id_and_keys() {
        let (client, server) = pair().await;

        assert_eq!(client.session_id(), server.session_id());
        let c = client.session_keys();
        let s = server.session_keys();
        assert!(c.rx.read_with(|a| s.tx.read_with(|b| a == b)));
        assert!(c.tx.read_with(|a| s.rx.read_with(|b| a == b)));
        assert_eq!(client.state(), ConnectionState::Established);
    }

    #[tokio::test]
    async fn frames_flow_after_handshake() {
        let (client, server) = pair().await;

        client
            .send(&Message::PreauthAccept { message_id: 99 })
            .await
            .unwrap();
        client.send(&Message::KeepAlive).await.unwrap();

        let mut reader = server.take_reader().unwrap();
        let mut deframer = Deframer::with_leftover(&reader.leftover);
        let mut seen = Vec::new();
        let mut tmp = [0u8; 1024];
        while seen.len() < 2 {
            let n = reader.read.read(&mut tmp).await.unwrap();
            assert_ne!(n, 0, "peer hung up early");
            deframer.feed(&tmp[..n]);
            while let Some(frame) = deframer.next_frame() {
                seen.push(Message::decode(&frame).unwrap());
            }
        }
        assert_eq!(seen[0], Message::PreauthAccept { message_id: 99 });
        assert_eq!(seen[1], Message::KeepAlive);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut bogus = vec![0x13, 0x37, 0x00, 0x00];
            bogus.resize(SERVER_HELLO_SIZE, 0);
            stream.write_all(&bogus).await.unwrap();
        });

        let ma: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        let kp = Keypair::generate().unwrap();
        assert!(matches!(
            Connection::connect(&ma, &kp, TIMEOUT).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn handshake_timeout_fails_the_connection() {
        // A listener that accepts but never sends its hello.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let ma: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        let kp = Keypair::generate().unwrap();
        let started = std::time::Instant::now();
        let result = Connection::connect(&ma, &kp, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_sends() {
        let (client, _server) = pair().await;
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send(&Message::KeepAlive).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn early_first_frame_lands_in_leftover() {
        // A client that appends its first frame to the handshake reply in
        // one write: the server must retain those bytes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_kp = Keypair::generate().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::accept(stream, &server_kp, TIMEOUT).await.unwrap()
        });

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut hello = Vec::new();
        read_at_least(&mut stream, &mut hello, SERVER_HELLO_SIZE)
            .await
            .unwrap();
        let client_kp = Keypair::generate().unwrap();
        let mut reply = hello[4..36].to_vec();
        reply.extend_from_slice(client_kp.public.as_bytes());
        let early = framing::frame(&Message::KeepAlive.encode().unwrap()).unwrap();
        reply.extend_from_slice(&early);
        stream.write_all(&reply).await.unwrap();

        let conn = server.await.unwrap();
        let mut reader = conn.take_reader().unwrap();
        let mut deframer = Deframer::with_leftover(&reader.leftover);
        // The early frame may or may not have ridden along with the reply
        // in one segment; read on until it surfaces.
        loop {
            if let Some(frame) = deframer.next_frame() {
                assert_eq!(Message::decode(&frame).unwrap(), Message::KeepAlive);
                break;
            }
            let mut tmp = [0u8; 256];
            let n = reader.read.read(&mut tmp).await.unwrap();
            assert_ne!(n, 0);
            deframer.feed(&tmp[..n]);
        }
    }
}
