use crate::crdt::{CrdtDoc, Position};
use crate::error::{Error, Result};
use crate::repo::RepoLink;
use crate::types::DocumentId;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Known by id only; no value has arrived yet
    Initializing,
    Ready,
}

/// An encoded delta produced by [`DocHandle::compute_outbound_delta`].
///
/// Holds the sync position that preceded it so a failed send can hand the
/// delta back to [`DocHandle::rewind`].
#[derive(Debug, Clone)]
pub struct OutboundDelta {
    pub bytes: Bytes,
    from: Position,
}

struct DocState {
    doc: CrdtDoc,
    /// Everything up to here has been handed out as a delta or came from
    /// elsewhere
    synced: Position,
}

/// Untyped state shared by every `DocHandle<T>` of one document.
pub(crate) struct DocCore {
    id: DocumentId,
    state: Mutex<DocState>,
    status: watch::Sender<HandleState>,
    changes: watch::Sender<u64>,
    link: OnceLock<RepoLink>,
}

impl DocCore {
    pub(crate) fn new(id: DocumentId, doc: CrdtDoc, status: HandleState) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(DocState {
                doc,
                synced: Position::default(),
            }),
            status: watch::channel(status).0,
            changes: watch::channel(0).0,
            link: OnceLock::new(),
        })
    }

    pub(crate) fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Route local changes of this document to a repo's write scheduler.
    ///
    /// # Panics
    /// If the document is already attached to a repo.
    pub(crate) fn attach(&self, link: RepoLink) {
        assert!(
            self.link.set(link).is_ok(),
            "document {} already belongs to a repo",
            self.id
        );
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> HandleState {
        *self.status.borrow()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    pub(crate) fn compute_outbound_delta(&self) -> Result<Option<OutboundDelta>> {
        let mut state = self.lock();
        let current = state.doc.current_position();
        match state.doc.diff_since(&state.synced)? {
            None => Ok(None),
            Some(bytes) => {
                let from = std::mem::replace(&mut state.synced, current);
                trace!("outbound delta for {}: {} bytes", self.id, bytes.len());
                Ok(Some(OutboundDelta { bytes, from }))
            }
        }
    }

    pub(crate) fn rewind(&self, delta: OutboundDelta) {
        let mut state = self.lock();
        let current = state.doc.current_position();
        let peer = state.doc.peer_id();
        let mut from = delta.from;
        from.absorb_remote(&current, peer);
        state.synced = from;
    }

    pub(crate) fn apply_incoming(&self, delta: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            state.doc.merge(delta)?;
            let current = state.doc.current_position();
            let peer = state.doc.peer_id();
            state.synced.absorb_remote(&current, peer);
        }

        let became_ready = self.status.send_if_modified(|status| {
            if *status == HandleState::Initializing {
                *status = HandleState::Ready;
                true
            } else {
                false
            }
        });
        if became_ready {
            trace!("document {} ready", self.id);
        }
        self.notify();
        Ok(())
    }

    fn value(&self) -> Result<serde_json::Map<String, Value>> {
        if self.state() != HandleState::Ready {
            return Err(Error::NotReady(self.id.clone()));
        }
        Ok(self.lock().doc.value())
    }
}

/// Handle on one CRDT document, typed by the value it holds.
///
/// `T` must serialize to a JSON object: each top-level field is stored as
/// one key of the document, so concurrent edits to different fields merge.
/// Handles are cheap to clone; clones share the document.
pub struct DocHandle<T> {
    core: Arc<DocCore>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for DocHandle<T> {
    fn clone(&self) -> Self {
        Self::from_core(self.core.clone())
    }
}

impl<T> fmt::Debug for DocHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

impl<T> DocHandle<T> {
    pub(crate) fn from_core(core: Arc<DocCore>) -> Self {
        Self {
            core,
            _value: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<DocCore> {
        &self.core
    }

    /// A handle for a document known only by id. It becomes ready when the
    /// first value arrives through [`DocHandle::apply_incoming`].
    pub fn lookup(id: DocumentId) -> Self {
        Self::from_core(DocCore::new(id, CrdtDoc::new(), HandleState::Initializing))
    }

    pub fn id(&self) -> &DocumentId {
        &self.core.id
    }

    pub fn state(&self) -> HandleState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    pub async fn when_ready(&self) {
        let mut status = self.core.status.subscribe();
        let _ = status
            .wait_for(|status| *status == HandleState::Ready)
            .await;
    }

    /// Receiver notified after every local change and every merged delta.
    /// Drop it to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.changes.subscribe()
    }

    /// Encoded changes made since the last delta was handed out, if any.
    /// Handing out a delta advances the sync position; pass the delta to
    /// [`DocHandle::rewind`] if it could not be sent.
    pub fn compute_outbound_delta(&self) -> Result<Option<OutboundDelta>> {
        self.core.compute_outbound_delta()
    }

    /// Undo the sync position advance of a delta that was not delivered.
    pub fn rewind(&self, delta: OutboundDelta) {
        self.core.rewind(delta)
    }

    /// Merge a delta or snapshot produced by another replica. Safe to call
    /// with duplicate or reordered deltas.
    pub fn apply_incoming(&self, delta: &[u8]) -> Result<()> {
        self.core.apply_incoming(delta)
    }

    /// Full snapshot of the document
    pub fn export(&self) -> Result<Bytes> {
        self.core.lock().doc.export()
    }

    /// True if both handles refer to the same underlying document state
    pub fn ptr_eq(&self, other: &DocHandle<T>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: Serialize + DeserializeOwned> DocHandle<T> {
    /// A new, immediately ready document. `initial` is recorded as one local
    /// change.
    pub fn create(initial: Option<&T>) -> Result<Self> {
        let doc = match initial {
            Some(value) => CrdtDoc::from_value(&to_object(value)?)?,
            None => CrdtDoc::new(),
        };
        Ok(Self::from_core(DocCore::new(
            DocumentId::random(),
            doc,
            HandleState::Ready,
        )))
    }

    /// A ready document with a fresh id holding the history in `bytes`
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let doc = CrdtDoc::load(bytes)?;
        Ok(Self::from_core(DocCore::new(
            DocumentId::random(),
            doc,
            HandleState::Ready,
        )))
    }

    pub fn value(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.core.value()?))?)
    }

    /// Apply a local edit. Fields whose value changed are written, fields
    /// that disappeared are deleted. Performs no I/O; if the handle belongs
    /// to a repo, the repo's write task is scheduled.
    pub fn change<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut T),
    {
        if !self.is_ready() {
            return Err(Error::NotReady(self.core.id.clone()));
        }

        {
            let state = self.core.lock();
            let before = state.doc.value();
            let mut value: T = serde_json::from_value(Value::Object(before.clone()))?;
            mutator(&mut value);
            let after = to_object(&value)?;

            state.doc.change(|tx| {
                for (key, field) in &after {
                    if before.get(key) != Some(field) {
                        tx.set(key.clone(), field.clone());
                    }
                }
                for key in before.keys() {
                    if !after.contains_key(key) {
                        tx.delete(key.clone());
                    }
                }
            })?;
        }

        self.core.notify();
        if let Some(link) = self.core.link.get() {
            link.mark_pending(&self.core.id);
        }
        Ok(())
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<serde_json::Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidDocument(format!(
            "document value must serialize to an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Note {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        x: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        y: Option<i64>,
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
            ..Note::default()
        }
    }

    #[test]
    fn test_create_is_ready() {
        let handle = DocHandle::create(Some(&note("a"))).unwrap();
        assert!(handle.is_ready());
        assert_eq!(handle.value().unwrap(), note("a"));
    }

    #[test]
    fn test_lookup_is_initializing() {
        let handle = DocHandle::<Note>::lookup("doc-1".into());
        assert_eq!(handle.state(), HandleState::Initializing);
        assert!(matches!(handle.value(), Err(Error::NotReady(_))));
        assert!(matches!(
            handle.change(|n| n.text.push('x')),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_delta_reaches_independent_handle() {
        let source = DocHandle::create(Some(&note("a"))).unwrap();
        let delta = source.compute_outbound_delta().unwrap().unwrap();

        let target = DocHandle::<Note>::lookup(source.id().clone());
        target.apply_incoming(&delta.bytes).unwrap();
        assert!(target.is_ready());
        assert_eq!(target.value().unwrap(), note("a"));
    }

    #[test]
    fn test_apply_twice_equals_once() {
        let source = DocHandle::create(Some(&note("a"))).unwrap();
        let delta = source.compute_outbound_delta().unwrap().unwrap();

        let target = DocHandle::<Note>::lookup(source.id().clone());
        target.apply_incoming(&delta.bytes).unwrap();
        let once = target.value().unwrap();
        target.apply_incoming(&delta.bytes).unwrap();
        assert_eq!(target.value().unwrap(), once);
    }

    #[test]
    fn test_delta_is_handed_out_once() {
        let handle = DocHandle::create(Some(&note("a"))).unwrap();
        let first = handle.compute_outbound_delta().unwrap().unwrap();
        assert!(handle.compute_outbound_delta().unwrap().is_none());

        handle.change(|n| n.x = Some(1)).unwrap();
        handle.change(|n| n.y = Some(2)).unwrap();
        let second = handle.compute_outbound_delta().unwrap().unwrap();
        assert!(handle.compute_outbound_delta().unwrap().is_none());

        let target = DocHandle::<Note>::lookup(handle.id().clone());
        target.apply_incoming(&first.bytes).unwrap();
        target.apply_incoming(&second.bytes).unwrap();
        assert_eq!(target.value().unwrap(), handle.value().unwrap());
    }

    #[test]
    fn test_rewind_recomputes_delta() {
        let handle = DocHandle::create(Some(&note("a"))).unwrap();
        let delta = handle.compute_outbound_delta().unwrap().unwrap();
        handle.rewind(delta);

        let retry = handle.compute_outbound_delta().unwrap().unwrap();
        let target = DocHandle::<Note>::lookup(handle.id().clone());
        target.apply_incoming(&retry.bytes).unwrap();
        assert_eq!(target.value().unwrap(), note("a"));
    }

    #[test]
    fn test_remote_changes_are_not_echoed() {
        let a = DocHandle::create(Some(&note("a"))).unwrap();
        let b = DocHandle::<Note>::lookup(a.id().clone());
        b.apply_incoming(&a.compute_outbound_delta().unwrap().unwrap().bytes)
            .unwrap();

        assert!(b.compute_outbound_delta().unwrap().is_none());
    }

    #[test]
    fn test_removed_field_is_deleted() {
        let handle = DocHandle::create(Some(&Note {
            text: "a".into(),
            x: Some(1),
            y: None,
        }))
        .unwrap();
        handle.change(|n| n.x = None).unwrap();
        assert_eq!(handle.value().unwrap(), note("a"));
    }

    #[test]
    fn test_change_notifies_subscribers() {
        let handle = DocHandle::create(Some(&note("a"))).unwrap();
        let mut changes = handle.subscribe();
        handle.change(|n| n.text = "b".into()).unwrap();
        assert!(changes.has_changed().unwrap());
        drop(changes);
        handle.change(|n| n.text = "c".into()).unwrap();
    }

    #[test]
    fn test_garbage_delta_is_rejected() {
        let handle = DocHandle::<Note>::lookup("doc".into());
        assert!(matches!(
            handle.apply_incoming(b"garbage"),
            Err(Error::Decode(_))
        ));
        assert_eq!(handle.state(), HandleState::Initializing);
    }

    #[test]
    fn test_non_object_value_is_rejected() {
        let result = DocHandle::create(Some(&42u32));
        assert!(matches!(result, Err(Error::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn test_when_ready() {
        let source = DocHandle::create(Some(&note("a"))).unwrap();
        let target = DocHandle::<Note>::lookup(source.id().clone());
        let waiter = {
            let target = target.clone();
            tokio::spawn(async move { target.when_ready().await })
        };
        target.apply_incoming(&source.export().unwrap()).unwrap();
        waiter.await.unwrap();
        assert!(target.ptr_eq(&target.clone()));
    }
}
