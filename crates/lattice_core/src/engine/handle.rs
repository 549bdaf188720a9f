//! Document handles.
//!
//! A [`DocHandle`] wraps a `yrs` document holding a space document's three
//! root maps (`objects`, `links`, `access`) behind a shareable reference with
//! a lifecycle state machine (`Loading -> Ready | Unavailable`) and change
//! events carrying per-key patches.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "objects"  object id -> JSON-encoded ObjectStructure
//! ├── Y.Map "links"    object id -> document URL string
//! └── Y.Map "access"   "space_key" -> owning space key
//! ```
//!
//! Values are whole JSON strings replaced per key, so a shallow map observer
//! sees every object-level change and the handle can report it as a
//! `["objects", id]` or `["links", id]` patch. Snapshots returned by
//! [`DocHandle::doc_sync`] are immutable decoded values; all mutation goes
//! through [`DocHandle::change`] / [`DocHandle::change_at`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, Observable, ReadTxn, StateVector, Transact, TransactionMut, Update};

use super::storage::DocStorage;
use crate::error::{LatticeError, Result};
use crate::event::{Callback, CallbackRegistry, CallbackSubscription};
use crate::types::{
    DocUrl, Heads, ObjectId, ObjectStructure, Patch, PathSegment, SpaceAccess, SpaceDoc, SpaceKey,
    UpdateOrigin,
};

/// Name of the map holding inline objects.
const OBJECTS_MAP: &str = "objects";

/// Name of the map holding links to per-object documents.
const LINKS_MAP: &str = "links";

/// Name of the map holding the owning-space stamp.
const ACCESS_MAP: &str = "access";

/// Key of the space key entry within the access map.
const ACCESS_SPACE_KEY: &str = "space_key";

/// Lifecycle state of a document handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The document is being resolved; its content is not yet observable.
    Loading,
    /// The document is loaded and observable.
    Ready,
    /// The document could not be resolved. Permanent for this handle.
    Unavailable,
}

/// Change notification emitted by a handle after its document changed.
#[derive(Clone)]
pub struct ChangeEvent {
    /// The handle whose document changed.
    pub handle: DocHandle,
    /// Per-key patches describing what changed.
    pub patches: Vec<Patch>,
}

impl std::fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("url", self.handle.url())
            .field("patches", &self.patches.len())
            .finish()
    }
}

/// A locally produced binary update, emitted for outbound replication.
#[derive(Debug, Clone)]
pub struct DocUpdated {
    /// URL of the document that changed.
    pub url: DocUrl,
    /// Binary update payload.
    pub payload: Vec<u8>,
}

/// Shareable reference to a CRDT document keyed by a stable URL.
///
/// Cloning is cheap; all clones observe the same document and state.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    url: DocUrl,
    doc: Doc,
    objects: MapRef,
    links: MapRef,
    access: MapRef,
    storage: Arc<dyn DocStorage>,
    state: watch::Sender<HandleState>,
    deleted: AtomicBool,
    /// Patches buffered by map observers during a transaction, drained and
    /// emitted after the transaction ends.
    pending_patches: Mutex<Vec<Patch>>,
    change_listeners: CallbackRegistry<ChangeEvent>,
    /// Session-wide sink for locally produced updates, shared with the repo.
    local_updates: CallbackRegistry<DocUpdated>,
    _observers: Mutex<Vec<yrs::Subscription>>,
}

impl DocHandle {
    pub(crate) fn new(
        url: DocUrl,
        state: HandleState,
        storage: Arc<dyn DocStorage>,
        local_updates: CallbackRegistry<DocUpdated>,
    ) -> Self {
        let doc = Doc::new();
        let objects = doc.get_or_insert_map(OBJECTS_MAP);
        let links = doc.get_or_insert_map(LINKS_MAP);
        let access = doc.get_or_insert_map(ACCESS_MAP);
        let (state_tx, _) = watch::channel(state);

        let handle = Self {
            inner: Arc::new(HandleInner {
                url,
                doc,
                objects,
                links,
                access,
                storage,
                state: state_tx,
                deleted: AtomicBool::new(false),
                pending_patches: Mutex::new(Vec::new()),
                change_listeners: CallbackRegistry::new(),
                local_updates,
                _observers: Mutex::new(Vec::new()),
            }),
        };
        handle.install_observers();
        handle
    }

    /// Observers only buffer patches; emission happens after the transaction
    /// ends, back in the handle's own entry points, so listeners can start
    /// new transactions.
    fn install_observers(&self) {
        let objects_sub = {
            let weak = Arc::downgrade(&self.inner);
            self.inner.objects.observe(move |txn, event| {
                if let Some(inner) = weak.upgrade() {
                    buffer_patches(&inner, OBJECTS_MAP, event.keys(txn));
                }
            })
        };
        let links_sub = {
            let weak = Arc::downgrade(&self.inner);
            self.inner.links.observe(move |txn, event| {
                if let Some(inner) = weak.upgrade() {
                    buffer_patches(&inner, LINKS_MAP, event.keys(txn));
                }
            })
        };
        let mut observers = self.inner._observers.lock().unwrap();
        *observers = vec![objects_sub, links_sub];
    }

    /// The document's stable URL.
    pub fn url(&self) -> &DocUrl {
        &self.inner.url
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        *self.inner.state.borrow()
    }

    /// Whether the handle is ready.
    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    /// Whether the document was explicitly deleted.
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: HandleState) {
        let _ = self.inner.state.send_replace(state);
    }

    /// Wait until the handle leaves the `Loading` state.
    ///
    /// Resolves with `Ok(())` once ready, or
    /// [`LatticeError::DocumentUnavailable`] if the document is permanently
    /// unavailable.
    pub async fn when_ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                HandleState::Ready => return Ok(()),
                HandleState::Unavailable => {
                    return Err(LatticeError::DocumentUnavailable {
                        url: self.inner.url.clone(),
                    });
                }
                HandleState::Loading => {}
            }
            if rx.changed().await.is_err() {
                return Err(LatticeError::DocumentUnavailable {
                    url: self.inner.url.clone(),
                });
            }
        }
    }

    /// Current synced snapshot, `None` until the handle is ready.
    pub fn doc_sync(&self) -> Option<SpaceDoc> {
        if !self.is_ready() {
            return None;
        }
        Some(self.read_doc())
    }

    fn read_doc(&self) -> SpaceDoc {
        let txn = self.inner.doc.transact();

        let mut objects = BTreeMap::new();
        for (key, value) in self.inner.objects.iter(&txn) {
            let json = value.to_string(&txn);
            match serde_json::from_str::<ObjectStructure>(&json) {
                Ok(structure) => {
                    objects.insert(ObjectId::from(key.to_string()), structure);
                }
                Err(err) => {
                    log::warn!(
                        "skipping undecodable object {} in {}: {}",
                        key,
                        self.inner.url,
                        err
                    );
                }
            }
        }

        let mut links = BTreeMap::new();
        for (key, value) in self.inner.links.iter(&txn) {
            let raw = value.to_string(&txn);
            if let Some(url) = DocUrl::parse(&raw) {
                links.insert(ObjectId::from(key.to_string()), url);
            }
        }

        let access = self
            .inner
            .access
            .get(&txn, ACCESS_SPACE_KEY)
            .map(|value| SpaceAccess {
                space_key: SpaceKey::from(value.to_string(&txn).as_str()),
            });

        SpaceDoc {
            objects,
            links,
            access,
        }
    }

    /// Apply a mutation to the document.
    ///
    /// The incremental update is persisted to storage and published for
    /// outbound replication; change listeners are notified with the
    /// resulting patches.
    pub fn change<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SpaceTxn<'_, '_>),
    {
        self.ensure_not_deleted()?;
        let update = self.mutate(f);
        if !update.is_empty() {
            self.inner
                .storage
                .append_update(self.inner.url.as_str(), &update, UpdateOrigin::Local)?;
            self.inner.local_updates.emit(&DocUpdated {
                url: self.inner.url.clone(),
                payload: update,
            });
        }
        self.drain_and_emit();
        Ok(())
    }

    /// Apply a mutation against a specific version of the document.
    ///
    /// The mutation is applied at the current state and merged by the CRDT
    /// (the engine's behavior for changes against historical versions).
    /// Returns the resulting version markers, or `None` if the mutation was
    /// a no-op.
    pub fn change_at<F>(&self, heads: &Heads, f: F) -> Result<Option<Heads>>
    where
        F: FnOnce(&mut SpaceTxn<'_, '_>),
    {
        self.ensure_not_deleted()?;
        if *heads != self.heads() {
            log::debug!(
                "change_at against stale heads on {}; merging at current state",
                self.inner.url
            );
        }
        let update = self.mutate(f);
        if update.is_empty() {
            self.drain_and_emit();
            return Ok(None);
        }
        self.inner
            .storage
            .append_update(self.inner.url.as_str(), &update, UpdateOrigin::Local)?;
        self.inner.local_updates.emit(&DocUpdated {
            url: self.inner.url.clone(),
            payload: update,
        });
        self.drain_and_emit();
        Ok(Some(self.heads()))
    }

    fn mutate<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut SpaceTxn<'_, '_>),
    {
        let sv_before = {
            let txn = self.inner.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.inner.doc.transact_mut();
            let mut space = SpaceTxn {
                txn: &mut txn,
                objects: &self.inner.objects,
                links: &self.inner.links,
                access: &self.inner.access,
            };
            f(&mut space);
        }
        let txn = self.inner.doc.transact();
        txn.encode_state_as_update_v1(&sv_before)
    }

    /// Current version markers (encoded state vector).
    pub fn heads(&self) -> Heads {
        let txn = self.inner.doc.transact();
        Heads::from_bytes(txn.state_vector().encode_v1())
    }

    /// Subscribe to change events.
    pub fn on_change(&self, callback: Callback<ChangeEvent>) -> CallbackSubscription<ChangeEvent> {
        self.inner.change_listeners.subscribe(callback)
    }

    /// Apply an update received from a peer or relay.
    ///
    /// The update is persisted with the given origin. A handle still in the
    /// `Loading` state becomes ready: the update resolves the document, and
    /// its content is reported through snapshots rather than replayed as
    /// change events.
    pub(crate) fn apply_remote_update(&self, payload: &[u8], origin: UpdateOrigin) -> Result<()> {
        self.apply_payload(payload)?;
        self.inner
            .storage
            .append_update(self.inner.url.as_str(), payload, origin)?;
        if self.state() == HandleState::Loading {
            self.inner.pending_patches.lock().unwrap().clear();
            self.set_state(HandleState::Ready);
        } else {
            self.drain_and_emit();
        }
        Ok(())
    }

    /// Apply stored payloads during initial resolution, without re-persisting
    /// them and without emitting change events for pre-existing content.
    pub(crate) fn apply_initial(&self, payloads: &[Vec<u8>]) -> Result<()> {
        for payload in payloads {
            self.apply_payload(payload)?;
        }
        self.inner.pending_patches.lock().unwrap().clear();
        Ok(())
    }

    fn apply_payload(&self, payload: &[u8]) -> Result<()> {
        let update =
            Update::decode_v1(payload).map_err(|e| LatticeError::Decode(e.to_string()))?;
        let mut txn = self.inner.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| LatticeError::Decode(e.to_string()))?;
        Ok(())
    }

    /// Persist the current document state as a snapshot.
    pub fn save(&self) -> Result<()> {
        let state = {
            let txn = self.inner.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        self.inner.storage.save_doc(self.inner.url.as_str(), &state)
    }

    /// Delete the document from storage and mark the handle deleted.
    ///
    /// Used for ephemeral documents bound to a cancellation scope. Idempotent.
    pub fn delete(&self) -> Result<()> {
        if self.inner.deleted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("deleting document {}", self.inner.url);
        self.inner.storage.delete_doc(self.inner.url.as_str())
    }

    fn ensure_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(LatticeError::DocumentDeleted {
                url: self.inner.url.clone(),
            });
        }
        Ok(())
    }

    fn drain_and_emit(&self) {
        let patches: Vec<Patch> = {
            let mut pending = self.inner.pending_patches.lock().unwrap();
            pending.drain(..).collect()
        };
        if patches.is_empty() {
            return;
        }
        self.inner.change_listeners.emit(&ChangeEvent {
            handle: self.clone(),
            patches,
        });
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

fn buffer_patches(
    inner: &HandleInner,
    map_name: &str,
    keys: &std::collections::HashMap<Arc<str>, EntryChange>,
) {
    let mut pending = inner.pending_patches.lock().unwrap();
    for (key, change) in keys.iter() {
        let value = match change {
            EntryChange::Inserted(value) | EntryChange::Updated(_, value) => {
                let raw = value.clone().cast::<String>().unwrap_or_default();
                Some(decode_patch_value(map_name, raw))
            }
            EntryChange::Removed(_) => None,
        };
        pending.push(Patch {
            path: vec![
                PathSegment::Key(map_name.to_string()),
                PathSegment::Key(key.to_string()),
            ],
            value,
        });
    }
}

/// Object entries hold JSON documents; link entries hold raw URL strings.
fn decode_patch_value(map_name: &str, raw: String) -> serde_json::Value {
    if map_name == OBJECTS_MAP {
        serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
    } else {
        serde_json::Value::String(raw)
    }
}

/// Typed view over a space document inside a mutation.
///
/// Passed to the closures given to [`DocHandle::change`] and
/// [`DocHandle::change_at`].
pub struct SpaceTxn<'a, 'doc> {
    txn: &'a mut TransactionMut<'doc>,
    objects: &'a MapRef,
    links: &'a MapRef,
    access: &'a MapRef,
}

impl SpaceTxn<'_, '_> {
    /// Read the object structure stored at an id, if any.
    pub fn object(&self, id: &ObjectId) -> Option<ObjectStructure> {
        self.objects
            .get(&*self.txn, id.as_str())
            .and_then(|value| serde_json::from_str(&value.to_string(&*self.txn)).ok())
    }

    /// Write the object structure at an id.
    pub fn set_object(&mut self, id: &ObjectId, structure: &ObjectStructure) {
        let json = serde_json::to_string(structure).unwrap_or_default();
        self.objects.insert(self.txn, id.as_str(), json);
    }

    /// Remove the object entry at an id.
    ///
    /// Prefer tombstoning via the object's `system.deleted` flag; removal is
    /// only for garbage collection.
    pub fn remove_object(&mut self, id: &ObjectId) {
        let _ = self.objects.remove(self.txn, id.as_str());
    }

    /// Read the link recorded for an id, if any.
    pub fn link(&self, id: &ObjectId) -> Option<DocUrl> {
        self.links
            .get(&*self.txn, id.as_str())
            .and_then(|value| DocUrl::parse(&value.to_string(&*self.txn)))
    }

    /// Record a link from an id to a separate document.
    pub fn set_link(&mut self, id: &ObjectId, url: &DocUrl) {
        self.links
            .insert(self.txn, id.as_str(), url.as_str().to_string());
    }

    /// Remove the link entry at an id.
    pub fn remove_link(&mut self, id: &ObjectId) {
        let _ = self.links.remove(self.txn, id.as_str());
    }

    /// The owning-space stamp, if present.
    pub fn access(&self) -> Option<SpaceKey> {
        self.access
            .get(&*self.txn, ACCESS_SPACE_KEY)
            .map(|value| SpaceKey::from(value.to_string(&*self.txn).as_str()))
    }

    /// Stamp the owning space.
    pub fn set_access(&mut self, space_key: &SpaceKey) {
        self.access
            .insert(self.txn, ACCESS_SPACE_KEY, space_key.as_str().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStorage;
    use std::sync::Mutex as StdMutex;

    fn test_handle() -> DocHandle {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        DocHandle::new(
            DocUrl::random(),
            HandleState::Ready,
            storage,
            CallbackRegistry::new(),
        )
    }

    fn sample_structure() -> ObjectStructure {
        let mut data = BTreeMap::new();
        data.insert("title".to_string(), serde_json::json!("hello"));
        ObjectStructure::new(data, None)
    }

    #[test]
    fn test_set_and_read_object() {
        let handle = test_handle();
        let id = ObjectId::random();
        let structure = sample_structure();

        handle
            .change(|doc| doc.set_object(&id, &structure))
            .unwrap();

        let doc = handle.doc_sync().unwrap();
        assert_eq!(doc.objects.get(&id), Some(&structure));
    }

    #[test]
    fn test_links_and_access() {
        let handle = test_handle();
        let id = ObjectId::random();
        let url = DocUrl::random();
        let space_key = SpaceKey::random();

        handle
            .change(|doc| {
                doc.set_link(&id, &url);
                doc.set_access(&space_key);
            })
            .unwrap();

        let doc = handle.doc_sync().unwrap();
        assert_eq!(doc.links.get(&id), Some(&url));
        assert_eq!(doc.access.unwrap().space_key, space_key);
    }

    #[test]
    fn test_change_emits_patches() {
        let handle = test_handle();
        let id = ObjectId::random();
        let url = DocUrl::random();

        let events: Arc<StdMutex<Vec<ChangeEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = handle.on_change(Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        handle
            .change(|doc| {
                doc.set_object(&id, &sample_structure());
                doc.set_link(&id, &url);
            })
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let patches = &events[0].patches;
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().any(|patch| {
            patch.path[0].as_key() == Some("objects") && patch.path[1].as_key() == Some(id.as_str())
        }));
        assert!(patches.iter().any(|patch| {
            patch.path[0].as_key() == Some("links")
                && patch.value == Some(serde_json::Value::String(url.as_str().to_string()))
        }));
    }

    #[test]
    fn test_tombstone_keeps_object_entry() {
        let handle = test_handle();
        let id = ObjectId::random();
        handle
            .change(|doc| doc.set_object(&id, &sample_structure()))
            .unwrap();

        handle
            .change(|doc| {
                let mut structure = doc.object(&id).unwrap();
                structure.system.deleted = true;
                doc.set_object(&id, &structure);
            })
            .unwrap();

        let doc = handle.doc_sync().unwrap();
        let structure = doc.objects.get(&id).expect("tombstoned object still present");
        assert!(structure.system.deleted);
    }

    #[test]
    fn test_change_at_noop_returns_none() {
        let handle = test_handle();
        let heads = handle.heads();
        let result = handle.change_at(&heads, |_doc| {}).unwrap();
        assert!(result.is_none());

        let id = ObjectId::random();
        let result = handle
            .change_at(&heads, |doc| doc.set_object(&id, &sample_structure()))
            .unwrap();
        let new_heads = result.expect("mutation produced new heads");
        assert_ne!(new_heads, heads);
        assert_eq!(new_heads, handle.heads());
    }

    #[test]
    fn test_updates_replicate_between_handles() {
        let source = test_handle();
        let target = test_handle();
        let id = ObjectId::random();

        let updates: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let _sub = source
            .inner
            .local_updates
            .subscribe(Arc::new(move |update: &DocUpdated| {
                sink.lock().unwrap().push(update.payload.clone());
            }));

        source
            .change(|doc| doc.set_object(&id, &sample_structure()))
            .unwrap();

        for payload in updates.lock().unwrap().iter() {
            target
                .apply_remote_update(payload, UpdateOrigin::Remote)
                .unwrap();
        }

        assert_eq!(
            target.doc_sync().unwrap().objects.get(&id),
            Some(&sample_structure())
        );
    }

    #[test]
    fn test_remote_update_resolves_loading_handle_without_events() {
        let source = test_handle();
        let id = ObjectId::random();
        source
            .change(|doc| doc.set_object(&id, &sample_structure()))
            .unwrap();
        let payload = {
            let txn = source.inner.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let target = DocHandle::new(
            DocUrl::random(),
            HandleState::Loading,
            storage,
            CallbackRegistry::new(),
        );
        let events: Arc<StdMutex<usize>> = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&events);
        let _sub = target.on_change(Arc::new(move |_: &ChangeEvent| {
            *sink.lock().unwrap() += 1;
        }));

        assert!(target.doc_sync().is_none());
        target
            .apply_remote_update(&payload, UpdateOrigin::Sync)
            .unwrap();

        assert!(target.is_ready());
        assert_eq!(*events.lock().unwrap(), 0);
        assert!(target.doc_sync().unwrap().objects.contains_key(&id));
    }

    #[test]
    fn test_deleted_handle_rejects_changes() {
        let handle = test_handle();
        handle.delete().unwrap();
        assert!(handle.is_deleted());

        let id = ObjectId::random();
        let result = handle.change(|doc| doc.set_object(&id, &sample_structure()));
        assert!(matches!(
            result,
            Err(LatticeError::DocumentDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_when_ready_resolves_on_state_change() {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let handle = DocHandle::new(
            DocUrl::random(),
            HandleState::Loading,
            storage,
            CallbackRegistry::new(),
        );

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.when_ready().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.set_state(HandleState::Ready);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_when_ready_fails_on_unavailable() {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let handle = DocHandle::new(
            DocUrl::random(),
            HandleState::Unavailable,
            storage,
            CallbackRegistry::new(),
        );
        assert!(matches!(
            handle.when_ready().await,
            Err(LatticeError::DocumentUnavailable { .. })
        ));
    }
}
