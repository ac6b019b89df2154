use crate::types::{DocumentId, FeedId, SpaceId};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the replication core.
///
/// Variants fall into three groups: caller-input errors (`Decode`,
/// `NotWritable`, `SpaceNotFound`, ...) which are always returned to the
/// immediate caller, transient conditions (`Timeout`) which the caller is
/// expected to retry, and storage failures from the feed store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not writable: {0}")]
    NotWritable(String),

    #[error("space {0} not found")]
    SpaceNotFound(SpaceId),

    #[error("index {index} out of range for feed {feed_id} (length {length})")]
    OutOfRange {
        feed_id: FeedId,
        index: u64,
        length: u64,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("document {0} is not ready")]
    NotReady(DocumentId),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("feed {0} already has a writer")]
    WriterExists(FeedId),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
