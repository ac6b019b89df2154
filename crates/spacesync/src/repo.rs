use crate::config::RepoConfig;
use crate::crdt::CrdtDoc;
use crate::data_service::{DataService, DocumentFilter, SubscribeEvent};
use crate::doc_handle::{DocCore, DocHandle, HandleState, OutboundDelta};
use crate::error::{Error, Result};
use crate::scheduler::UpdateScheduler;
use crate::types::{Batch, DocUpdate, DocumentId, SpaceId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Connects a document to the repo that owns it: local changes mark the
/// document pending and poke the write scheduler.
pub(crate) struct RepoLink {
    pending: Arc<Mutex<BTreeSet<DocumentId>>>,
    scheduler: UpdateScheduler,
}

impl RepoLink {
    pub(crate) fn mark_pending(&self, id: &DocumentId) {
        // A closed repo never writes again.
        if self.scheduler.is_closed() {
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        self.scheduler.schedule();
    }
}

#[derive(Default)]
struct Outbound {
    updates: Vec<DocUpdate>,
    sent: Vec<(Arc<DocCore>, OutboundDelta)>,
    /// First delta failure of the run. The failed documents stay pending.
    deferred: Option<Error>,
}

struct RepoShared {
    space_id: SpaceId,
    client_tag: String,
    handles: RwLock<HashMap<DocumentId, Arc<DocCore>>>,
    pending: Arc<Mutex<BTreeSet<DocumentId>>>,
    filter: DocumentFilter,
}

impl RepoShared {
    fn get(&self, id: &DocumentId) -> Option<Arc<DocCore>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn apply_remote(&self, update: &DocUpdate) {
        let Some(core) = self.get(&update.document_id) else {
            panic!(
                "received update for unregistered document {} in space {}",
                update.document_id, self.space_id
            );
        };
        if let Err(e) = core.apply_incoming(&update.delta) {
            warn!(
                "space {}: rejected update for {}: {}",
                self.space_id, update.document_id, e
            );
        }
    }

    fn route(&self, event: SubscribeEvent) {
        for update in &event.batch.updates {
            self.apply_remote(update);
        }
        if event.client_tag.as_deref() == Some(self.client_tag.as_str()) {
            if let (Some(feed_id), Some(seq)) = (event.feed_id, event.seq) {
                trace!("space {}: own write confirmed at {}:{}", self.space_id, feed_id, seq);
            }
        }
    }

    /// Take the pending set and compute a delta for each document in it.
    fn collect_outbound<F>(&self, delta_of: F) -> Outbound
    where
        F: Fn(&DocCore) -> Result<Option<OutboundDelta>>,
    {
        let ids = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut outbound = Outbound::default();
        for id in ids {
            let Some(core) = self.get(&id) else {
                continue;
            };
            match delta_of(core.as_ref()) {
                Ok(Some(delta)) => {
                    outbound.updates.push(DocUpdate {
                        document_id: id,
                        delta: delta.bytes.clone(),
                    });
                    outbound.sent.push((core, delta));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("space {}: no delta for {}: {}", self.space_id, id, e);
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id);
                    outbound.deferred.get_or_insert(e);
                }
            }
        }
        outbound
    }

    /// One run of the write task: collect the deltas of every pending
    /// document into a single batch and submit it. Documents whose delta
    /// could not be computed stay pending and fail the run, so the
    /// scheduler tries them again.
    async fn write_pending(&self, service: &DataService) -> Result<()> {
        let Outbound {
            updates,
            sent,
            deferred,
        } = self.collect_outbound(DocCore::compute_outbound_delta);
        if updates.is_empty() {
            return deferred.map_or(Ok(()), Err);
        }

        let count = updates.len();
        match service
            .write(self.space_id, Batch { updates }, Some(self.client_tag.clone()))
            .await
        {
            Ok(receipt) => {
                debug!(
                    "space {}: wrote {} document updates at {}:{}",
                    self.space_id, count, receipt.feed_id, receipt.seq
                );
                deferred.map_or(Ok(()), Err)
            }
            Err(e) => {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                for (core, delta) in sent {
                    pending.insert(core.id().clone());
                    core.rewind(delta);
                }
                Err(e)
            }
        }
    }
}

/// Registry of the documents one client works with in one space.
///
/// Local changes are never written synchronously. They mark their document
/// pending and schedule the write task, which batches the deltas of all
/// pending documents into one write per run and then waits the configured
/// interval before it can run again.
pub struct Repo {
    service: Arc<DataService>,
    shared: Arc<RepoShared>,
    scheduler: UpdateScheduler,
    writer: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Repo {
    /// Subscribe to `space_id` and start the write and routing tasks.
    pub async fn open(service: Arc<DataService>, space_id: SpaceId, config: &RepoConfig) -> Result<Self> {
        let filter = DocumentFilter::new();
        let mut subscription = service.subscribe_documents(space_id, filter.clone()).await?;

        let shared = Arc::new(RepoShared {
            space_id,
            client_tag: uuid::Uuid::new_v4().to_string(),
            handles: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
            filter,
        });

        let (scheduler, writer) = {
            let shared = shared.clone();
            let service = service.clone();
            UpdateScheduler::spawn(config.write_interval(), move || {
                let shared = shared.clone();
                let service = service.clone();
                async move { shared.write_pending(&service).await }
            })
        };

        let router = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    shared.route(event);
                }
                debug!("space {}: subscription ended", shared.space_id);
            })
        };

        info!("space {}: repo opened", space_id);
        Ok(Self {
            service,
            shared,
            scheduler,
            writer: Mutex::new(Some(writer)),
            router: Mutex::new(Some(router)),
        })
    }

    pub fn space_id(&self) -> SpaceId {
        self.shared.space_id
    }

    /// Tag attached to every batch this repo writes
    pub fn client_tag(&self) -> &str {
        &self.shared.client_tag
    }

    /// Create a new document. The handle is usable immediately; the initial
    /// value is written by the next run of the write task.
    pub fn create<T: Serialize + DeserializeOwned>(&self, initial: Option<&T>) -> Result<DocHandle<T>> {
        let handle = DocHandle::create(initial)?;
        self.register(handle.core().clone());
        self.link().mark_pending(handle.id());
        debug!("space {}: created document {}", self.shared.space_id, handle.id());
        Ok(handle)
    }

    /// Add a document from an exported snapshot under a fresh id. Its whole
    /// history is written by the next run of the write task.
    pub fn import<T: Serialize + DeserializeOwned>(&self, bytes: &[u8]) -> Result<DocHandle<T>> {
        let handle = DocHandle::import(bytes)?;
        self.register(handle.core().clone());
        self.link().mark_pending(handle.id());
        Ok(handle)
    }

    /// Get the handle for `id`. Repeated calls return handles on the same
    /// document. An id seen for the first time is loaded from the space; if
    /// the space has no value for it yet, the handle stays initializing until
    /// one arrives.
    pub async fn find<T>(&self, id: &DocumentId) -> Result<DocHandle<T>> {
        if let Some(core) = self.shared.get(id) {
            return Ok(DocHandle::from_core(core));
        }

        let (core, is_new) = {
            let mut handles = self
                .shared
                .handles
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match handles.get(id) {
                Some(core) => (core.clone(), false),
                None => {
                    let core = DocCore::new(id.clone(), CrdtDoc::new(), HandleState::Initializing);
                    core.attach(self.link());
                    handles.insert(id.clone(), core.clone());
                    (core, true)
                }
            }
        };

        if is_new {
            self.shared.filter.insert(id.clone());
            if let Some(snapshot) = self.service.load(self.shared.space_id, id).await? {
                core.apply_incoming(&snapshot)?;
            }
            debug!(
                "space {}: tracking document {} ({:?})",
                self.shared.space_id,
                id,
                core.state()
            );
        }
        Ok(DocHandle::from_core(core))
    }

    /// Merge an update received for a document of this repo.
    ///
    /// # Panics
    /// If no handle is registered for the update's document.
    pub fn apply_remote(&self, update: &DocUpdate) {
        self.shared.apply_remote(update)
    }

    /// Ids of every registered document
    pub fn documents(&self) -> Vec<DocumentId> {
        self.shared
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Write everything changed before this call. Resolves once a write run
    /// that started after the call has completed.
    pub async fn flush(&self) {
        self.scheduler.flush().await
    }

    /// Stop the write and routing tasks and release every handle. A write
    /// run in progress completes; changes not yet written are dropped.
    ///
    /// # Panics
    /// If the routing task panicked, its panic is resumed here once the repo
    /// has been released.
    pub async fn close(&self) {
        self.scheduler.close();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("space {}: write task failed: {}", self.shared.space_id, e);
            }
        }
        let router = self.router.lock().unwrap_or_else(PoisonError::into_inner).take();
        let router_panic = match router {
            Some(router) if router.is_finished() => match router.await {
                Err(e) if e.is_panic() => Some(e.into_panic()),
                _ => None,
            },
            Some(router) => {
                router.abort();
                None
            }
            None => None,
        };

        self.shared
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("space {}: repo closed", self.shared.space_id);
        if let Some(panic) = router_panic {
            std::panic::resume_unwind(panic);
        }
    }

    fn link(&self) -> RepoLink {
        RepoLink {
            pending: self.shared.pending.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    fn register(&self, core: Arc<DocCore>) {
        core.attach(self.link());
        let id = core.id().clone();
        self.shared
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), core);
        self.shared.filter.insert(id);
    }
}
