//! X25519 key exchange and directional session-key derivation.
//!
//! A node holds one static [`Keypair`]. After the transport handshake each
//! side derives a pair of directional session keys from its own keypair and
//! the peer's public key:
//!
//! ```text
//! shared = X25519(own_secret, peer_public)
//! keys   = SHA-512(shared || client_public || server_public)
//! client: rx = keys[0..32], tx = keys[32..64]
//! server: tx = keys[0..32], rx = keys[32..64]
//! ```
//!
//! so that `rx(client) == tx(server)` and `tx(client) == rx(server)`.

use zeroize::Zeroize;

use crate::hash;
use crate::random;
use crate::secret::SecretBuf;
use crate::{CryptoError, KX_SECRET_KEY_SIZE, KX_SESSION_KEY_SIZE};

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Import a public key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Export the public key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex_prefix(&self.0))
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// A static X25519 keypair. The secret half lives in a [`SecretBuf`].
#[derive(Debug, Clone)]
pub struct Keypair {
    /// Public half, shared on the wire during the handshake.
    pub public: PublicKey,
    /// Secret half, only ever read inside a scoped access.
    pub secret: SecretBuf,
}

impl Keypair {
    /// Generate a fresh random keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = random::random_32()?;
        let sk = x25519_dalek::StaticSecret::from(seed);
        seed.zeroize();

        let public = PublicKey(x25519_dalek::PublicKey::from(&sk).to_bytes());
        let mut sk_bytes = sk.to_bytes();
        let secret = SecretBuf::from_bytes(&sk_bytes);
        sk_bytes.zeroize();

        Ok(Self { public, secret })
    }
}

/// Directional session keys derived from a completed key exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Receive key: decrypts/authenticates traffic from the peer.
    pub rx: SecretBuf,
    /// Transmit key: protects traffic sent to the peer.
    pub tx: SecretBuf,
}

/// Derive the client side's session keys.
///
/// `own` is the client's static keypair, `server_public` the key received in
/// the server's handshake hello.
///
/// # Errors
///
/// Returns [`CryptoError::WeakPublicKey`] if the peer key is a low-order
/// point, or [`CryptoError::BadSecretLength`] if the keypair is malformed.
pub fn client_session(own: &Keypair, server_public: &PublicKey) -> Result<SessionKeys, CryptoError> {
    derive(own, server_public, own.public.as_bytes(), server_public.as_bytes(), Side::Client)
}

/// Derive the server side's session keys.
///
/// `own` is the server's static keypair, `client_public` the key echoed back
/// in the client's handshake reply.
///
/// # Errors
///
/// Returns [`CryptoError::WeakPublicKey`] if the peer key is a low-order
/// point, or [`CryptoError::BadSecretLength`] if the keypair is malformed.
pub fn server_session(own: &Keypair, client_public: &PublicKey) -> Result<SessionKeys, CryptoError> {
    derive(own, client_public, client_public.as_bytes(), own.public.as_bytes(), Side::Server)
}

enum Side {
    Client,
    Server,
}

fn derive(
    own: &Keypair,
    peer: &PublicKey,
    client_public: &[u8; 32],
    server_public: &[u8; 32],
    side: Side,
) -> Result<SessionKeys, CryptoError> {
    if own.secret.len() != KX_SECRET_KEY_SIZE {
        return Err(CryptoError::BadSecretLength {
            expected: KX_SECRET_KEY_SIZE,
            actual: own.secret.len(),
        });
    }

    let mut shared = own.secret.read_with(|sk| {
        let mut sk_bytes = [0u8; 32];
        sk_bytes.copy_from_slice(sk);
        let secret = x25519_dalek::StaticSecret::from(sk_bytes);
        sk_bytes.zeroize();
        secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(*peer.as_bytes()))
            .to_bytes()
    });

    if shared == [0u8; 32] {
        return Err(CryptoError::WeakPublicKey);
    }

    // Both sides hash the same transcript: shared point, then the public
    // keys in client/server order.
    let mut transcript = [0u8; 96];
    transcript[..32].copy_from_slice(&shared);
    transcript[32..64].copy_from_slice(client_public);
    transcript[64..].copy_from_slice(server_public);
    shared.zeroize();

    let mut keys = hash::sha512(&transcript);
    transcript.zeroize();

    let (lo, hi) = keys.split_at(KX_SESSION_KEY_SIZE);
    let out = match side {
        Side::Client => SessionKeys {
            rx: SecretBuf::from_bytes(lo),
            tx: SecretBuf::from_bytes(hi),
        },
        Side::Server => SessionKeys {
            tx: SecretBuf::from_bytes(lo),
            rx: SecretBuf::from_bytes(hi),
        },
    };
    keys.zeroize();

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_public_nonzero() {
        let kp = Keypair::generate().unwrap();
        assert_ne!(*kp.public.as_bytes(), [0u8; 32]);
    }

    #[test]
    fn session_keys_mirror() {
        let client = Keypair::generate().unwrap();
        let server = Keypair::generate().unwrap();

        let cli = client_session(&client, &server.public).unwrap();
        let srv = server_session(&server, &client.public).unwrap();

        assert!(cli.rx.read_with(|a| srv.tx.read_with(|b| a == b)));
        assert!(cli.tx.read_with(|a| srv.rx.read_with(|b| a == b)));
        // The two directions use distinct keys.
        assert!(!cli.rx.read_with(|a| cli.tx.read_with(|b| a == b)));
    }

    #[test]
    fn distinct_peers_distinct_keys() {
        let client = Keypair::generate().unwrap();
        let server_a = Keypair::generate().unwrap();
        let server_b = Keypair::generate().unwrap();

        let a = client_session(&client, &server_a.public).unwrap();
        let b = client_session(&client, &server_b.public).unwrap();
        assert!(!a.rx.read_with(|x| b.rx.read_with(|y| x == y)));
    }

    #[test]
    fn low_order_peer_rejected() {
        let kp = Keypair::generate().unwrap();
        let low_order = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            client_session(&kp, &low_order),
            Err(CryptoError::WeakPublicKey)
        ));
    }
}
