use crate::crdt::CrdtDoc;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::proto;
use crate::types::{Batch, DocUpdate, DocumentId, FeedId, FeedMessage, Receipt, SpaceId};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Set of document ids a subscription is interested in. Clones share the set,
/// so ids added after subscribing take effect immediately.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    ids: Arc<StdRwLock<HashSet<DocumentId>>>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already present
    pub fn insert(&self, id: DocumentId) -> bool {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One item pushed to a subscriber. The first event of every subscription is
/// a snapshot and has no feed position.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeEvent {
    pub batch: Batch,
    pub feed_id: Option<FeedId>,
    pub seq: Option<u64>,
    /// Set only on the host that accepted the write carrying this tag
    pub client_tag: Option<String>,
}

impl SubscribeEvent {
    pub fn is_snapshot(&self) -> bool {
        self.feed_id.is_none()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SubscribeEvent>,
}

impl Subscription {
    /// Next event, or `None` once the host is closed
    pub async fn recv(&mut self) -> Option<SubscribeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SubscribeEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<SubscribeEvent>,
    filter: Option<DocumentFilter>,
}

impl Subscriber {
    /// Returns false once the receiving side is gone
    fn send(&self, event: &SubscribeEvent) -> bool {
        let event = match &self.filter {
            None => event.clone(),
            Some(filter) => {
                let updates: Vec<DocUpdate> = event
                    .batch
                    .updates
                    .iter()
                    .filter(|update| filter.contains(&update.document_id))
                    .cloned()
                    .collect();
                if updates.is_empty() && !event.is_snapshot() {
                    return !self.tx.is_closed();
                }
                SubscribeEvent {
                    batch: Batch { updates },
                    ..event.clone()
                }
            }
        };
        self.tx.send(event).is_ok()
    }
}

/// Materialized state of one space.
#[derive(Default)]
struct HostState {
    documents: BTreeMap<DocumentId, CrdtDoc>,
    subscribers: Vec<Subscriber>,
    /// Tags of writes accepted here that have not come back through the
    /// pipeline yet
    client_tags: HashMap<(FeedId, u64), String>,
}

impl HostState {
    fn apply(&mut self, space_id: SpaceId, message: FeedMessage) {
        let client_tag = self.client_tags.remove(&(message.feed_id, message.seq));
        let batch = match proto::decode_batch(&message.payload) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    "space {}: ignoring undecodable batch at {}:{}: {}",
                    space_id, message.feed_id, message.seq, e
                );
                return;
            }
        };

        // A document only enters the materialized state once a delta for it
        // merged; rejected updates are not passed on to subscribers.
        let mut accepted = Vec::with_capacity(batch.updates.len());
        for update in batch.updates {
            let merged = match self.documents.get(&update.document_id) {
                Some(doc) => doc.merge(&update.delta),
                None => CrdtDoc::load(&update.delta).map(|doc| {
                    self.documents.insert(update.document_id.clone(), doc);
                }),
            };
            match merged {
                Ok(()) => accepted.push(update),
                Err(e) => warn!(
                    "space {}: rejected update for {} at {}:{}: {}",
                    space_id, update.document_id, message.feed_id, message.seq, e
                ),
            }
        }
        trace!(
            "space {}: applied {} updates from {}:{}",
            space_id,
            accepted.len(),
            message.feed_id,
            message.seq
        );

        let event = SubscribeEvent {
            batch: Batch { updates: accepted },
            feed_id: Some(message.feed_id),
            seq: Some(message.seq),
            client_tag,
        };
        self.subscribers.retain(|subscriber| subscriber.send(&event));
    }

    fn snapshot(&self, space_id: SpaceId) -> Batch {
        let updates = self
            .documents
            .iter()
            .filter_map(|(id, doc)| match doc.export() {
                Ok(delta) => Some(DocUpdate {
                    document_id: id.clone(),
                    delta,
                }),
                Err(e) => {
                    error!("space {}: failed to export {}: {}", space_id, id, e);
                    None
                }
            })
            .collect();
        Batch { updates }
    }
}

/// Subscribe/write boundary of one space. Consumes the space's pipeline,
/// keeps the merged state of every document, and fans committed batches out
/// to subscribers.
pub struct DataServiceHost {
    space_id: SpaceId,
    pipeline: Arc<Pipeline>,
    state: Arc<Mutex<HostState>>,
    write_lock: Mutex<()>,
    processor: StdMutex<Option<JoinHandle<()>>>,
}

impl DataServiceHost {
    /// Start consuming `pipeline`. Must be called within a tokio runtime.
    pub fn open(space_id: SpaceId, pipeline: Arc<Pipeline>) -> Arc<Self> {
        let state = Arc::new(Mutex::new(HostState::default()));
        let processor = tokio::spawn(Self::process(
            space_id,
            pipeline.clone(),
            state.clone(),
        ));
        info!("space {}: data service host opened", space_id);

        Arc::new(Self {
            space_id,
            pipeline,
            state,
            write_lock: Mutex::new(()),
            processor: StdMutex::new(Some(processor)),
        })
    }

    async fn process(space_id: SpaceId, pipeline: Arc<Pipeline>, state: Arc<Mutex<HostState>>) {
        loop {
            match pipeline.next_message().await {
                Ok(Some(message)) => state.lock().await.apply(space_id, message),
                Ok(None) => break,
                Err(e) => {
                    error!("space {}: pipeline read failed: {}", space_id, e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
        debug!("space {}: processing stopped", space_id);
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Every document, then every batch committed from now on
    pub async fn subscribe(&self) -> Subscription {
        self.add_subscriber(None).await
    }

    /// Like [`DataServiceHost::subscribe`], restricted to the ids in `filter`
    pub async fn subscribe_documents(&self, filter: DocumentFilter) -> Subscription {
        self.add_subscriber(Some(filter)).await
    }

    async fn add_subscriber(&self, filter: Option<DocumentFilter>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { tx, filter };

        let mut state = self.state.lock().await;
        let snapshot = SubscribeEvent {
            batch: state.snapshot(self.space_id),
            feed_id: None,
            seq: None,
            client_tag: None,
        };
        if subscriber.send(&snapshot) {
            state.subscribers.push(subscriber);
        }
        debug!(
            "space {}: {} subscribers",
            self.space_id,
            state.subscribers.len()
        );

        Subscription { rx }
    }

    /// Append a batch to the writable feed. A `client_tag` is attached to
    /// the event for this batch once it comes back through the pipeline.
    pub async fn write(&self, batch: Batch, client_tag: Option<String>) -> Result<Receipt> {
        let payload = proto::encode_batch(&batch);
        // Writes are serialized so the position reserved for the tag is the
        // one the append lands on. The state lock is not held across I/O.
        let _serial = self.write_lock.lock().await;
        let reserved = match client_tag {
            Some(tag) => match self.pipeline.next_write_position().await {
                Some(position) => {
                    self.state
                        .lock()
                        .await
                        .client_tags
                        .insert((position.feed_id, position.seq), tag);
                    Some(position)
                }
                None => None,
            },
            None => None,
        };

        let result = self.pipeline.write(payload).await;
        if let Some(position) = reserved {
            if !matches!(&result, Ok(receipt) if *receipt == position) {
                let mut state = self.state.lock().await;
                let tag = state.client_tags.remove(&(position.feed_id, position.seq));
                if let (Ok(receipt), Some(tag)) = (&result, tag) {
                    warn!(
                        "space {}: write landed at {}:{}, expected {}:{}",
                        self.space_id, receipt.feed_id, receipt.seq, position.feed_id, position.seq
                    );
                    state
                        .client_tags
                        .insert((receipt.feed_id, receipt.seq), tag);
                }
            }
        }
        let receipt = result?;
        debug!(
            "space {}: wrote {} updates at {}:{}",
            self.space_id,
            batch.updates.len(),
            receipt.feed_id,
            receipt.seq
        );
        Ok(receipt)
    }

    /// Full snapshot of one document as materialized so far
    pub async fn load(&self, document_id: &DocumentId) -> Result<Option<Bytes>> {
        let state = self.state.lock().await;
        state
            .documents
            .get(document_id)
            .map(CrdtDoc::export)
            .transpose()
    }

    pub async fn documents(&self) -> Vec<DocumentId> {
        self.state.lock().await.documents.keys().cloned().collect()
    }

    /// Stop processing, release the writable feed and end every subscription.
    pub async fn close(&self) {
        self.pipeline.close().await;
        let processor = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(processor) = processor {
            if let Err(e) = processor.await {
                error!("space {}: processor task failed: {}", self.space_id, e);
            }
        }

        let mut state = self.state.lock().await;
        state.subscribers.clear();
        state.client_tags.clear();
        info!("space {}: data service host closed", self.space_id);
    }
}

/// Routes subscribe/write calls to the host of the addressed space.
/// Registration is driven by whoever opens and closes spaces.
#[derive(Default)]
pub struct DataService {
    hosts: RwLock<HashMap<SpaceId, Arc<DataServiceHost>>>,
}

impl DataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// If a host is already registered for the same space.
    pub async fn register(&self, host: Arc<DataServiceHost>) {
        let mut hosts = self.hosts.write().await;
        let space_id = host.space_id();
        assert!(
            !hosts.contains_key(&space_id),
            "space {} is already registered",
            space_id
        );
        hosts.insert(space_id, host);
        debug!("registered space {}", space_id);
    }

    pub async fn unregister(&self, space_id: SpaceId) -> Option<Arc<DataServiceHost>> {
        let host = self.hosts.write().await.remove(&space_id);
        if host.is_some() {
            debug!("unregistered space {}", space_id);
        }
        host
    }

    pub async fn host(&self, space_id: SpaceId) -> Result<Arc<DataServiceHost>> {
        self.hosts
            .read()
            .await
            .get(&space_id)
            .cloned()
            .ok_or(Error::SpaceNotFound(space_id))
    }

    pub async fn spaces(&self) -> Vec<SpaceId> {
        self.hosts.read().await.keys().copied().collect()
    }

    pub async fn subscribe(&self, space_id: SpaceId) -> Result<Subscription> {
        Ok(self.host(space_id).await?.subscribe().await)
    }

    pub async fn subscribe_documents(
        &self,
        space_id: SpaceId,
        filter: DocumentFilter,
    ) -> Result<Subscription> {
        Ok(self.host(space_id).await?.subscribe_documents(filter).await)
    }

    pub async fn write(
        &self,
        space_id: SpaceId,
        batch: Batch,
        client_tag: Option<String>,
    ) -> Result<Receipt> {
        self.host(space_id).await?.write(batch, client_tag).await
    }

    pub async fn load(&self, space_id: SpaceId, document_id: &DocumentId) -> Result<Option<Bytes>> {
        self.host(space_id).await?.load(document_id).await
    }
}
