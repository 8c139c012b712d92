//! # Payload Serialization
//!
//! Application payloads are plain `serde` types encoded with bincode.
//! Services exchange them as the bytes of a data message; the transport never
//! looks inside.
//!
//! ## Usage
//! ```rust
//! use peer_link::core::serialization::Payload;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct CharacterLookup {
//!     account_id: u64,
//! }
//!
//! let bytes = CharacterLookup { account_id: 7 }.to_payload().unwrap();
//! let back = CharacterLookup::from_payload(&bytes).unwrap();
//! assert_eq!(back.account_id, 7);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Trait for types carried as application payloads
pub trait Payload: Serialize + DeserializeOwned + Sized {
    /// Serialize to payload bytes
    fn to_payload(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    /// Deserialize from payload bytes
    fn from_payload(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}

impl<T: Serialize + DeserializeOwned> Payload for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    enum RealmRequest {
        List,
        Join { realm_id: u32, character: String },
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_enum_payload() {
        let msg = RealmRequest::Join {
            realm_id: 12,
            character: "Aria".into(),
        };
        let bytes = msg.to_payload().expect("serialize");
        let back = RealmRequest::from_payload(&bytes).expect("deserialize");
        assert_eq!(back, msg);
        assert_ne!(
            RealmRequest::List.to_payload().expect("serialize"),
            bytes
        );
    }

    #[test]
    fn test_truncated_payload_is_deserialize_error() {
        let bytes = RealmRequest::Join {
            realm_id: 1,
            character: "Long name".into(),
        }
        .to_payload()
        .unwrap();
        let err = RealmRequest::from_payload(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::DeserializeError(_)));
    }
}
