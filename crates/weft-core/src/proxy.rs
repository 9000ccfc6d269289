//! Opaque session capability tokens.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::SessionId;

/// An opaque, comparable, serializable reference to a session.
///
/// A proxy carries no behavior and no handle to the live session; it is a
/// capability token resolved through [`Node::resolve`](crate::Node::resolve).
/// The text form is the base64 encoding of the session id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionProxy(SessionId);

impl SessionProxy {
    /// Wrap raw session id bytes.
    #[must_use]
    pub fn from_bytes(id: SessionId) -> Self {
        Self(id)
    }

    /// The wrapped session id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &SessionId {
        &self.0
    }

    /// Parse the base64 text form produced by [`Display`](fmt::Display).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the text is not base64 of exactly one
    /// session id.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(text)
            .map_err(|e| Error::Parse(format!("bad session proxy: {e}")))?;
        let id: SessionId = bytes
            .try_into()
            .map_err(|_| Error::Parse("bad session proxy length".into()))?;
        Ok(Self(id))
    }
}

impl fmt::Display for SessionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionProxy({}..)", &BASE64.encode(self.0)[..8])
    }
}

impl Serialize for SessionProxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionProxy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_is_base64() {
        let proxy = SessionProxy::from_bytes([0u8; 32]);
        assert_eq!(
            proxy.to_string(),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        );
    }

    #[test]
    fn text_round_trip() {
        let mut id = [0u8; 32];
        for (i, b) in id.iter_mut().enumerate() {
            *b = i as u8;
        }
        let proxy = SessionProxy::from_bytes(id);
        assert_eq!(SessionProxy::parse(&proxy.to_string()).unwrap(), proxy);
    }

    #[test]
    fn rejects_wrong_length_and_bad_text() {
        assert!(SessionProxy::parse("AQI=").is_err());
        assert!(SessionProxy::parse("not base64 !!").is_err());
    }

    #[test]
    fn ordering_and_equality_follow_bytes() {
        let a = SessionProxy::from_bytes([1u8; 32]);
        let b = SessionProxy::from_bytes([2u8; 32]);
        assert!(a < b);
        assert_eq!(a, SessionProxy::from_bytes([1u8; 32]));
    }

    #[test]
    fn serde_round_trip() {
        let proxy = SessionProxy::from_bytes([7u8; 32]);
        let bytes = bincode::serialize(&proxy).unwrap();
        assert_eq!(bincode::deserialize::<SessionProxy>(&bytes).unwrap(), proxy);
    }
}
