use crate::timeframe::Timeframe;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or decoding identifiers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid id length: {0} (expected 8)")]
    InvalidLength(usize),
    #[error("invalid id format: {0}")]
    InvalidFormat(String),
}

/// Defines a fixed-size 8 byte key with a prefixed hex text form,
/// e.g. `feed:00000000000000ff`.
macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            bytes: [u8; 8],
        }

        impl $name {
            pub fn from_u64(value: u64) -> Self {
                Self {
                    bytes: value.to_be_bytes(),
                }
            }

            pub fn random() -> Self {
                Self::from_u64(uuid::Uuid::new_v4().as_u64_pair().0)
            }

            pub fn as_u64(&self) -> u64 {
                u64::from_be_bytes(self.bytes)
            }

            pub fn bytes(&self) -> &[u8] {
                &self.bytes
            }

            /// Deserialize from the fixed 8-byte format
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| IdError::InvalidLength(bytes.len()))?;
                Ok(Self { bytes })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{:016x}", $prefix, self.as_u64())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let hex = s
                    .strip_prefix(concat!($prefix, ":"))
                    .ok_or_else(|| IdError::InvalidFormat(s.to_string()))?;
                if hex.len() != 16 {
                    return Err(IdError::InvalidFormat(s.to_string()));
                }
                u64::from_str_radix(hex, 16)
                    .map(Self::from_u64)
                    .map_err(|_| IdError::InvalidFormat(s.to_string()))
            }
        }
    };
}

key_type!(
    /// Identifies one append-only feed (one writer's log).
    FeedId,
    "feed"
);

key_type!(
    /// Identifies a space: the unit of replication that groups feeds and
    /// documents.
    SpaceId,
    "space"
);

/// Identifies a document within a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position assigned to a message when it is appended to a feed.
/// Sequence numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    pub feed_id: FeedId,
    pub seq: u64,
}

/// A message read back from a feed together with the timeframe its writer
/// declared when creating it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    pub feed_id: FeedId,
    pub seq: u64,
    pub timeframe: Timeframe,
    pub payload: Bytes,
}

impl FeedMessage {
    pub fn receipt(&self) -> Receipt {
        Receipt {
            feed_id: self.feed_id,
            seq: self.seq,
        }
    }
}

/// An encoded CRDT delta (or full snapshot) for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocUpdate {
    pub document_id: DocumentId,
    pub delta: Bytes,
}

/// The unit written to a feed by a data service host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub updates: Vec<DocUpdate>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
