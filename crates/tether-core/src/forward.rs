//! Inter-node relay format: what one gateway sends another when the target
//! session's socket lives elsewhere.
//!
//! JSON over HTTP. Payload bytes travel hex-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::session::{NodeId, SessionId};

/// Default ceiling on relay hops for a single delivery attempt.
///
/// A relayed item arriving with a hop count above this is dropped. With stale
/// or oscillating presence data this bounds the relay chain to a constant.
pub const MAX_FORWARD_HOPS: u32 = 3;

/// One relayed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardItem {
    pub session_id: SessionId,
    #[serde(with = "hex_payload")]
    pub payload: Bytes,
    /// Number of relays this attempt has already taken, including this one.
    pub hop_count: u32,
}

/// Batched relay from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Sending node, for logging only.
    pub origin: NodeId,
    pub items: Vec<ForwardItem>,
}

/// What the receiving node did with a [`ForwardRequest`].
///
/// `accepted` counts items resolved and delivered or re-relayed; `dropped`
/// counts items over the hop ceiling or with no reachable session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardAck {
    pub accepted: usize,
    pub dropped: usize,
}

/// Serde helper: `Bytes` as a hex string.
pub mod hex_payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(bytes))
    }
}
