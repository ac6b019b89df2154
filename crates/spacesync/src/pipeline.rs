use crate::clock::TimeframeClock;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::proto;
use crate::selector::{CausalSelector, MessageSelector};
use crate::storage::Feed;
use crate::timeframe::Timeframe;
use crate::types::{FeedId, FeedMessage, Receipt};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, trace, warn};

/// Read position of one attached feed plus its decoded head block, if any.
struct FeedCursor {
    feed: Arc<dyn Feed>,
    /// Index of the next block to deliver (equal to the last delivered seq)
    next_index: u64,
    length: watch::Receiver<u64>,
    candidate: Option<FeedMessage>,
}

impl FeedCursor {
    fn new(feed: Arc<dyn Feed>, start_seq: u64) -> Self {
        let length = feed.watch_len();
        Self {
            feed,
            next_index: start_seq,
            length,
            candidate: None,
        }
    }

    fn id(&self) -> FeedId {
        self.feed.id()
    }

    fn reset(&mut self, start_seq: u64) {
        self.next_index = start_seq;
        self.candidate = None;
    }

    /// Make sure the head block is loaded if the feed has one. Blocks that
    /// cannot be decoded are skipped and counted as processed.
    async fn poll_candidate(&mut self, clock: &TimeframeClock) -> Result<()> {
        let length = *self.length.borrow_and_update();
        while self.candidate.is_none() && self.next_index < length {
            let block = self.feed.read(self.next_index).await?;
            let seq = self.next_index + 1;
            match proto::decode_feed_message(self.id(), seq, &block) {
                Ok(message) => self.candidate = Some(message),
                Err(e) => {
                    warn!("skipping undecodable block {}:{}: {}", self.id(), seq, e);
                    self.next_index += 1;
                    clock.update_timeframe(self.id(), seq);
                }
            }
        }
        Ok(())
    }
}

/// Multiplexes N readable feeds (and at most one writable feed) into a
/// single causally ordered stream.
///
/// There is one consumer, which calls [`Pipeline::next_message`] in a loop.
/// A message is delivered only once every entry of the timeframe its writer
/// declared has been delivered. Within one feed messages are delivered in
/// append order.
pub struct Pipeline {
    config: PipelineConfig,
    clock: TimeframeClock,
    selector: Box<dyn MessageSelector>,
    feeds: Mutex<Vec<FeedCursor>>,
    writer: RwLock<Option<Arc<dyn Feed>>>,
    start_timeframe: RwLock<Timeframe>,
    target_timeframe: RwLock<Timeframe>,
    /// Bumped whenever the set of feeds or their cursors change
    generation: watch::Sender<u64>,
    paused: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    stalls: watch::Sender<u64>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_selector(config, Box::new(CausalSelector))
    }

    pub fn with_selector(config: PipelineConfig, selector: Box<dyn MessageSelector>) -> Self {
        Self {
            config,
            clock: TimeframeClock::default(),
            selector,
            feeds: Mutex::new(Vec::new()),
            writer: RwLock::new(None),
            start_timeframe: RwLock::new(Timeframe::new()),
            target_timeframe: RwLock::new(Timeframe::new()),
            generation: watch::channel(0).0,
            paused: watch::channel(false).0,
            closed: watch::channel(false).0,
            stalls: watch::channel(0).0,
        }
    }

    /// Attach a feed for reading. Delivery starts after the feed's entry in
    /// the start timeframe (from the beginning if it has none).
    ///
    /// # Panics
    /// If a feed with the same id is already attached.
    pub async fn add_feed(&self, feed: Arc<dyn Feed>) {
        let start_seq = self.start_timeframe.read().await.get(feed.id());
        self.add_feed_at(feed, start_seq).await;
    }

    /// Attach a feed for reading, resuming after `start_seq`.
    ///
    /// # Panics
    /// If a feed with the same id is already attached.
    pub async fn add_feed_at(&self, feed: Arc<dyn Feed>, start_seq: u64) {
        let id = feed.id();
        {
            let mut feeds = self.feeds.lock().await;
            assert!(
                !feeds.iter().any(|cursor| cursor.id() == id),
                "feed {} is already attached to this pipeline",
                id
            );
            feeds.push(FeedCursor::new(feed, start_seq));
        }
        self.generation.send_modify(|g| *g += 1);
        debug!("attached feed {} (resuming after seq {})", id, start_seq);
    }

    pub async fn has_feed(&self, feed_id: FeedId) -> bool {
        self.feeds
            .lock()
            .await
            .iter()
            .any(|cursor| cursor.id() == feed_id)
    }

    /// Ids of attached feeds, in attachment order
    pub async fn feeds(&self) -> Vec<FeedId> {
        self.feeds.lock().await.iter().map(FeedCursor::id).collect()
    }

    /// Designate the feed that `write` appends to. The feed is also attached
    /// for reading if it is not already, so local writes are echoed back.
    ///
    /// # Panics
    /// If the feed is read-only or a writable feed was already set.
    pub async fn set_writable_feed(&self, feed: Arc<dyn Feed>) {
        assert!(feed.is_writable(), "feed {} must be writable", feed.id());
        {
            let mut writer = self.writer.write().await;
            assert!(writer.is_none(), "pipeline already has a writable feed");
            *writer = Some(feed.clone());
        }
        info!("writable feed set to {}", feed.id());
        if !self.has_feed(feed.id()).await {
            self.add_feed(feed).await;
        }
    }

    pub async fn is_writable(&self) -> bool {
        self.writer.read().await.is_some()
    }

    pub async fn writable_feed_id(&self) -> Option<FeedId> {
        self.writer.read().await.as_ref().map(|feed| feed.id())
    }

    /// Position the next `write` will be assigned, if there is a writable
    /// feed. Only exact while writes are serialized by the caller.
    pub async fn next_write_position(&self) -> Option<Receipt> {
        self.writer.read().await.as_ref().map(|feed| Receipt {
            feed_id: feed.id(),
            seq: feed.len() + 1,
        })
    }

    /// Append a payload to the writable feed, stamped with the timeframe
    /// the pipeline has processed at the time of the call.
    pub async fn write(&self, payload: Bytes) -> Result<Receipt> {
        if self.is_closed() {
            return Err(Error::Closed("pipeline"));
        }
        let writer = self
            .writer
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NotWritable("pipeline has no writable feed".to_string()))?;

        let timeframe = self.clock.timeframe();
        let block = proto::encode_feed_message(&timeframe, payload);
        let receipt = writer.append(block).await?;
        trace!("wrote {}:{} at {}", receipt.feed_id, receipt.seq, timeframe);
        Ok(receipt)
    }

    /// Wait for and return the next deliverable message, advancing the
    /// clock past it. Returns `None` once the pipeline is closed.
    ///
    /// Cancel safe: dropping the future before it resolves delivers nothing.
    pub async fn next_message(&self) -> Result<Option<FeedMessage>> {
        let mut closed = self.closed.subscribe();
        let mut paused = self.paused.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Ok(None);
            }
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = closed.changed() => {}
                }
                continue;
            }

            let mut generation = self.generation.subscribe();
            let mut feeds = self.feeds.lock().await;
            for cursor in feeds.iter_mut() {
                cursor.poll_candidate(&self.clock).await?;
            }

            let current = self.clock.timeframe();
            let winner = {
                let (indices, candidates): (Vec<usize>, Vec<&FeedMessage>) = feeds
                    .iter()
                    .enumerate()
                    .filter_map(|(i, cursor)| cursor.candidate.as_ref().map(|m| (i, m)))
                    .unzip();
                self.selector
                    .select(&candidates, &current)
                    .map(|pick| indices[pick])
            };

            if let Some(index) = winner {
                if *closed.borrow() {
                    return Ok(None);
                }
                let cursor = &mut feeds[index];
                if let Some(message) = cursor.candidate.take() {
                    cursor.next_index += 1;
                    self.clock.update_timeframe(message.feed_id, message.seq);
                    return Ok(Some(message));
                }
                continue;
            }

            let diagnostic = describe_candidates(&feeds, &current);
            let feed_count = feeds.len();
            let mut lengths: Vec<watch::Receiver<u64>> =
                feeds.iter().map(|cursor| cursor.length.clone()).collect();
            drop(feeds);

            let progress = async {
                tokio::select! {
                    _ = any_changed(&mut lengths) => {}
                    _ = generation.changed() => {}
                    _ = paused.changed() => {}
                    _ = closed.changed() => {}
                }
            };
            tokio::pin!(progress);

            if tokio::time::timeout(self.config.stall_timeout(), &mut progress)
                .await
                .is_err()
            {
                warn!(
                    "stalled after {:?} with {} feeds at {}: {}",
                    self.config.stall_timeout(),
                    feed_count,
                    current,
                    diagnostic
                );
                self.stalls.send_modify(|n| *n += 1);
                progress.await;
            }
        }
    }

    /// Reset delivery to resume after `timeframe`. The clock is set to it and
    /// every attached cursor restarts after its entry.
    pub async fn set_cursor(&self, timeframe: Timeframe) {
        {
            let mut feeds = self.feeds.lock().await;
            for cursor in feeds.iter_mut() {
                cursor.reset(timeframe.get(cursor.id()));
            }
            *self.start_timeframe.write().await = timeframe.clone();
            self.clock.set_timeframe(timeframe.clone());
        }
        self.generation.send_modify(|g| *g += 1);
        info!("pipeline cursor set to {}", timeframe);
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
        debug!("pipeline paused");
    }

    pub fn unpause(&self) {
        self.paused.send_replace(false);
        debug!("pipeline unpaused");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop delivery and drop every feed handle, the writable one included.
    /// Pending and future `next_message` calls return `None`.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.writer.write().await.take();
        // Cursors hold their own handle on each feed, the writer's too.
        let released = {
            let mut feeds = self.feeds.lock().await;
            let count = feeds.len();
            feeds.clear();
            count
        };
        self.generation.send_modify(|g| *g += 1);
        info!(
            "pipeline closed at {}, released {} feeds",
            self.clock.timeframe(),
            released
        );
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Timeframe of everything delivered so far
    pub fn timeframe(&self) -> Timeframe {
        self.clock.timeframe()
    }

    pub fn subscribe_timeframe(&self) -> watch::Receiver<Timeframe> {
        self.clock.subscribe()
    }

    pub async fn start_timeframe(&self) -> Timeframe {
        self.start_timeframe.read().await.clone()
    }

    /// Last available seq of every non-empty attached feed
    pub async fn end_timeframe(&self) -> Timeframe {
        self.feeds
            .lock()
            .await
            .iter()
            .map(|cursor| (cursor.id(), cursor.feed.len()))
            .collect()
    }

    pub async fn target_timeframe(&self) -> Timeframe {
        self.target_timeframe.read().await.clone()
    }

    pub async fn set_target_timeframe(&self, target: Timeframe) {
        *self.target_timeframe.write().await = target;
    }

    /// Wait until `target` has been delivered, bounded by the configured
    /// wait timeout.
    pub async fn wait_until_timeframe(&self, target: &Timeframe) -> Result<()> {
        self.clock
            .wait_until_reached(target, self.config.wait_timeout())
            .await
    }

    /// Wait until the target timeframe is delivered. Returns `false` if the
    /// pipeline stalled first (with `break_on_stall`) or `timeout` elapsed.
    pub async fn wait_until_reached_target(
        &self,
        timeout: Option<Duration>,
        break_on_stall: bool,
    ) -> bool {
        let target = self.target_timeframe().await;
        let mut stalls = self.stalls.subscribe();

        let wait = async {
            tokio::select! {
                _ = self.clock.reached(&target) => true,
                _ = stalls.changed(), if break_on_stall => false,
            }
        };

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(reached) => reached,
                Err(_) => {
                    warn!(
                        "target timeframe {} not reached after {:?} (at {})",
                        target,
                        timeout,
                        self.timeframe()
                    );
                    false
                }
            },
            None => wait.await,
        }
    }

    /// Number of stall diagnostics emitted so far
    pub fn stall_count(&self) -> u64 {
        *self.stalls.borrow()
    }

    pub fn subscribe_stalled(&self) -> watch::Receiver<u64> {
        self.stalls.subscribe()
    }
}

/// Resolves when any of the receivers observes a new value. Never resolves
/// for an empty set.
async fn any_changed(receivers: &mut [watch::Receiver<u64>]) {
    if receivers.is_empty() {
        return std::future::pending().await;
    }
    let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
    let _ = futures::future::select_all(changes).await;
}

fn describe_candidates(feeds: &[FeedCursor], current: &Timeframe) -> String {
    let waiting: Vec<String> = feeds
        .iter()
        .filter_map(|cursor| cursor.candidate.as_ref())
        .map(|message| {
            format!(
                "{}:{} needs [{}]",
                message.feed_id,
                message.seq,
                Timeframe::dependencies(&message.timeframe, current)
            )
        })
        .collect();

    if waiting.is_empty() {
        "no candidates".to_string()
    } else {
        waiting.join("; ")
    }
}
