//! Generic payload body encoding.
//!
//! Application hooks exchange structured values; the pattern engines only
//! ever see the encoded bytes. Both peers must agree on this encoding, which
//! is bincode over serde throughout the workspace.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode a serde value into payload bytes.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the value cannot be encoded.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Parse(e.to_string()))
}

/// Decode payload bytes into a serde value.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the bytes do not decode as `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sandwich {
        cheese: bool,
        filler: String,
    }

    #[test]
    fn structured_round_trip() {
        let value = Sandwich {
            cheese: false,
            filler: "avocado".into(),
        };
        let bytes = encode(&value).unwrap();
        assert_eq!(decode::<Sandwich>(&bytes).unwrap(), value);
    }

    #[test]
    fn decode_mismatch_is_parse_error() {
        let bytes = encode(&42u8).unwrap();
        assert!(matches!(
            decode::<Sandwich>(&bytes),
            Err(Error::Parse(_))
        ));
    }
}
