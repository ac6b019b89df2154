use crate::error::{Error, Result};
use crate::timeframe::Timeframe;
use crate::types::FeedId;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{trace, warn};

/// The mutable causal cursor of one pipeline.
///
/// Every advance is published on a watch channel. Readers call
/// [`TimeframeClock::subscribe`] and drop the receiver to unsubscribe.
#[derive(Debug)]
pub struct TimeframeClock {
    timeframe: watch::Sender<Timeframe>,
}

impl TimeframeClock {
    pub fn new(start: Timeframe) -> Self {
        let (timeframe, _) = watch::channel(start);
        Self { timeframe }
    }

    /// Snapshot of the current timeframe
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe.borrow().clone()
    }

    /// Record that `seq` of `feed_id` has been processed.
    pub fn update_timeframe(&self, feed_id: FeedId, seq: u64) {
        self.timeframe.send_modify(|current| current.update(feed_id, seq));
        trace!("clock advanced to {}:{}", feed_id, seq);
    }

    /// Replace the current timeframe (used when a pipeline cursor is reset)
    pub fn set_timeframe(&self, timeframe: Timeframe) {
        self.timeframe.send_replace(timeframe);
    }

    pub fn has_gaps(&self, target: &Timeframe) -> bool {
        !Timeframe::dependencies(target, &self.timeframe.borrow()).is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Timeframe> {
        self.timeframe.subscribe()
    }

    /// Wait until every entry of `target` has been reached, or fail with
    /// [`Error::Timeout`] once `timeout` elapses.
    pub async fn wait_until_reached(&self, target: &Timeframe, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.reached(target)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    "timeout waiting for timeframe {} (current {}, missing {})",
                    target,
                    self.timeframe(),
                    Timeframe::dependencies(target, &self.timeframe())
                );
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Resolves once `target` is reached. Never resolves otherwise.
    pub(crate) async fn reached(&self, target: &Timeframe) {
        let mut rx = self.timeframe.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx
            .wait_for(|current| Timeframe::dependencies(target, current).is_empty())
            .await;
    }
}

impl Default for TimeframeClock {
    fn default() -> Self {
        Self::new(Timeframe::new())
    }
}
