use crate::error::{Error, Result};
use crate::storage::Feed;
use crate::types::{FeedId, Receipt};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::trace;

/// In-process feed. Cloning a read-only view shares the same blocks, which is
/// how tests and the dev binary stand in for the replication transport.
#[derive(Clone)]
pub struct MemoryFeed {
    id: FeedId,
    writable: bool,
    inner: Arc<MemoryFeedInner>,
}

struct MemoryFeedInner {
    blocks: RwLock<Vec<Bytes>>,
    length: watch::Sender<u64>,
}

impl MemoryFeed {
    /// Create an empty, writable feed
    pub fn new(id: FeedId) -> Self {
        let (length, _) = watch::channel(0);
        Self {
            id,
            writable: true,
            inner: Arc::new(MemoryFeedInner {
                blocks: RwLock::new(Vec::new()),
                length,
            }),
        }
    }

    /// A read-only handle over the same blocks
    pub fn read_only(&self) -> Self {
        Self {
            id: self.id,
            writable: false,
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    fn id(&self) -> FeedId {
        self.id
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn len(&self) -> u64 {
        *self.inner.length.borrow()
    }

    fn watch_len(&self) -> watch::Receiver<u64> {
        self.inner.length.subscribe()
    }

    async fn append(&self, payload: Bytes) -> Result<Receipt> {
        if !self.writable {
            return Err(Error::NotWritable(format!("feed {} is read-only", self.id)));
        }

        let seq = {
            let mut blocks = self
                .inner
                .blocks
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            blocks.push(payload);
            let seq = blocks.len() as u64;
            self.inner.length.send_replace(seq);
            seq
        };
        trace!("appended {}:{}", self.id, seq);

        Ok(Receipt {
            feed_id: self.id,
            seq,
        })
    }

    async fn read(&self, index: u64) -> Result<Bytes> {
        let blocks = self
            .inner
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        blocks
            .get(index as usize)
            .cloned()
            .ok_or(Error::OutOfRange {
                feed_id: self.id,
                index,
                length: blocks.len() as u64,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let feed = MemoryFeed::new(FeedId::from_u64(1));
        let r1 = feed.append(Bytes::from_static(b"a")).await.unwrap();
        let r2 = feed.append(Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(r1.seq, 1);
        assert_eq!(r2.seq, 2);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.read(0).await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(feed.read(1).await.unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_read_out_of_range() {
        let feed = MemoryFeed::new(FeedId::from_u64(1));
        feed.append(Bytes::from_static(b"a")).await.unwrap();
        let err = feed.read(1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                index: 1,
                length: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_only_view_shares_blocks() {
        let feed = MemoryFeed::new(FeedId::from_u64(1));
        let view = feed.read_only();
        let mut len = view.watch_len();

        assert!(!view.is_writable());
        assert!(matches!(
            view.append(Bytes::from_static(b"x")).await,
            Err(Error::NotWritable(_))
        ));

        feed.append(Bytes::from_static(b"a")).await.unwrap();
        len.changed().await.unwrap();
        assert_eq!(*len.borrow(), 1);
        assert_eq!(view.read(0).await.unwrap(), Bytes::from_static(b"a"));
    }
}
