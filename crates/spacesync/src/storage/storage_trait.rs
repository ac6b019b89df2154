use crate::error::Result;
use crate::types::{FeedId, Receipt};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

/// One append-only log, owned for writing by at most one component.
///
/// Key properties:
/// - `len` is monotonically non-decreasing
/// - the block at read index `i` carries sequence number `i + 1`
/// - readers learn about growth through `watch_len` rather than polling
#[async_trait]
pub trait Feed: Send + Sync {
    fn id(&self) -> FeedId;

    fn is_writable(&self) -> bool;

    /// Number of blocks currently readable
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that observes every change of `len`
    fn watch_len(&self) -> watch::Receiver<u64>;

    /// Append a block. Fails with `NotWritable` on a read-only handle.
    async fn append(&self, payload: Bytes) -> Result<Receipt>;

    /// Read the block at `index`. Fails with `OutOfRange` past the end.
    async fn read(&self, index: u64) -> Result<Bytes>;
}
