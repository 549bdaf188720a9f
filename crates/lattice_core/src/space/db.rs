//! Object registry for a space.
//!
//! The registry owns the set of live object binding cores, mediates
//! attach/detach, and reconciles document change events back into
//! object-level create/update/rebind outcomes via the loader's
//! classification. It is the attachment point application code uses to add
//! objects to a space.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::doc_loader::{DocumentLoader, ObjectDocumentLoaded, RootDocLoad};
use super::object_core::{BindOptions, ObjectCore};
use crate::engine::{ChangeEvent, DocHandle, DocumentContext};
use crate::error::{LatticeError, Result};
use crate::event::{Callback, CallbackRegistry, CallbackSubscription};
use crate::scope::Scope;
use crate::types::{DocUrl, ObjectId, SpaceKey, SpaceState, TypeRef};

/// Notification that a set of objects changed.
#[derive(Debug, Clone)]
pub struct ItemsUpdated {
    /// Ids of the changed objects.
    pub ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbState {
    Closed,
    Open,
}

/// Object registry for one space.
///
/// Cloning is cheap and shares the registry.
#[derive(Clone)]
pub struct SpaceDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    space_key: SpaceKey,
    context: Arc<DocumentContext>,
    loader: DocumentLoader,
    objects: Mutex<HashMap<ObjectId, Arc<ObjectCore>>>,
    update_event: CallbackRegistry<ItemsUpdated>,
    root_changed: CallbackRegistry<()>,
    state: Mutex<DbState>,
    scope: Mutex<Scope>,
    /// Change subscriptions on every document the registry listens to.
    subscriptions: Mutex<Vec<CallbackSubscription<ChangeEvent>>>,
    loader_sub: Mutex<Option<CallbackSubscription<ObjectDocumentLoaded>>>,
}

impl SpaceDb {
    /// Create a registry for a space over a document context.
    pub fn new(context: Arc<DocumentContext>, space_key: SpaceKey) -> Self {
        let loader = DocumentLoader::new(
            space_key.clone(),
            context.repo().clone(),
            context.config().clone(),
        );
        Self {
            inner: Arc::new(DbInner {
                space_key,
                context,
                loader,
                objects: Mutex::new(HashMap::new()),
                update_event: CallbackRegistry::new(),
                root_changed: CallbackRegistry::new(),
                state: Mutex::new(DbState::Closed),
                scope: Mutex::new(Scope::new()),
                subscriptions: Mutex::new(Vec::new()),
                loader_sub: Mutex::new(None),
            }),
        }
    }

    /// The owning space's key.
    pub fn space_key(&self) -> &SpaceKey {
        &self.inner.space_key
    }

    /// The space's document loader.
    pub fn loader(&self) -> &DocumentLoader {
        &self.inner.loader
    }

    /// Whether the registry is open.
    pub fn is_open(&self) -> bool {
        *self.inner.state.lock().unwrap() == DbState::Open
    }

    /// Open the registry: load the root document, create binding cores for
    /// every inline object, and start listening for document changes.
    /// Idempotent.
    pub async fn open(&self, space_state: &SpaceState) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == DbState::Open {
                log::info!("space {} database already open", self.inner.space_key);
                return Ok(());
            }
            *state = DbState::Open;
        }
        let scope = self.inner.scope.lock().unwrap().clone();

        // Loader-to-registry notification channel for lazy loads.
        let weak = Arc::downgrade(&self.inner);
        let loader_sub =
            self.inner
                .loader
                .on_object_document_loaded(Arc::new(move |loaded: &ObjectDocumentLoaded| {
                    if let Some(inner) = weak.upgrade() {
                        DbInner::handle_object_document_loaded(&inner, loaded);
                    }
                }));
        *self.inner.loader_sub.lock().unwrap() = Some(loader_sub);

        match self
            .inner
            .loader
            .load_space_root_doc_handle(&scope, space_state)
            .await
        {
            Ok(RootDocLoad::Degraded { reason }) => {
                log::warn!(
                    "space {} opened in degraded mode: {}",
                    self.inner.space_key,
                    reason
                );
            }
            Ok(_) => {}
            Err(LatticeError::Cancelled) => {
                log::debug!("space {} was closed while opening", self.inner.space_key);
                return Ok(());
            }
            Err(err) => {
                log::error!("failed to open space {}: {}", self.inner.space_key, err);
                return Err(err);
            }
        }

        let root = self.inner.loader.get_space_root_doc_handle()?;
        let root_doc = root.doc_sync().ok_or(LatticeError::NotReady)?;
        for object_id in root_doc.objects.keys() {
            DbInner::create_object_in_document(&self.inner, &root, object_id);
        }
        DbInner::subscribe_to_handle(&self.inner, &root);
        Ok(())
    }

    /// Close the registry: cancel pending loads and stop listening.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == DbState::Closed {
                return;
            }
            *state = DbState::Closed;
        }
        let scope = {
            let mut scope = self.inner.scope.lock().unwrap();
            std::mem::replace(&mut *scope, Scope::new())
        };
        scope.dispose();
        self.inner.loader.clear_document_loaded_observers();
        self.inner.loader_sub.lock().unwrap().take();
        self.inner.subscriptions.lock().unwrap().clear();
    }

    /// Add an object to the space.
    ///
    /// The object must be initialized and unattached. It is bound to the
    /// root document, or — with fragmentation enabled and a non-properties
    /// type — to a freshly created linked document.
    pub fn add(&self, core: Arc<ObjectCore>) -> Result<Arc<ObjectCore>> {
        if core.is_attached() {
            return Err(LatticeError::AlreadyAttached(core.id().clone()));
        }
        if !core.is_initialized() {
            return Err(LatticeError::ObjectNotInitialized(core.id().clone()));
        }
        {
            let mut objects = self.inner.objects.lock().unwrap();
            if objects.contains_key(core.id()) {
                return Err(LatticeError::DuplicateObject(core.id().clone()));
            }
            objects.insert(core.id().clone(), Arc::clone(&core));
        }

        let fragmented = self.inner.context.config().fragmentation_enabled
            && core.type_ref() != Some(TypeRef::properties());

        let bind_result = (|| {
            let handle = if fragmented {
                let handle = self.inner.loader.create_document_for_object(core.id())?;
                DbInner::subscribe_to_handle(&self.inner, &handle);
                handle
            } else {
                let root = self.inner.loader.get_space_root_doc_handle()?;
                self.inner
                    .loader
                    .on_object_created_in_document(&root, core.id());
                root
            };
            core.bind(BindOptions {
                handle,
                path: vec!["objects".to_string(), core.id().to_string()],
                assign_from_local_state: true,
            })
        })();

        if let Err(err) = bind_result {
            self.inner.objects.lock().unwrap().remove(core.id());
            return Err(err);
        }
        Ok(core)
    }

    /// O(1) lookup of a loaded object.
    ///
    /// An unknown id is not a fault: it triggers a lazy load of the object's
    /// linked document (if any) and returns `None`. Tombstoned objects also
    /// return `None`.
    pub fn get_object_core_by_id(&self, object_id: &ObjectId) -> Option<Arc<ObjectCore>> {
        let core = {
            let objects = self.inner.objects.lock().unwrap();
            objects.get(object_id).cloned()
        };
        match core {
            Some(core) => {
                if core.is_deleted() {
                    None
                } else {
                    Some(core)
                }
            }
            None => {
                if let Err(err) = self
                    .inner
                    .loader
                    .load_object_document(std::slice::from_ref(object_id))
                {
                    log::debug!("cannot load object {} yet: {}", object_id, err);
                }
                None
            }
        }
    }

    /// Load an object by id, waiting for its document if necessary.
    pub async fn load_object_by_id(
        &self,
        object_id: &ObjectId,
        timeout: Duration,
    ) -> Result<Arc<ObjectCore>> {
        if let Some(core) = self.get_object_core_by_id(object_id) {
            return Ok(core);
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let target = object_id.clone();
        let _sub = self
            .inner
            .update_event
            .subscribe(Arc::new(move |event: &ItemsUpdated| {
                if event.ids.contains(&target) {
                    let _ = tx.send(());
                }
            }));

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let core = {
                let objects = self.inner.objects.lock().unwrap();
                objects.get(object_id).cloned()
            };
            if let Some(core) = core {
                if core.is_deleted() {
                    return Err(LatticeError::ObjectNotFound(object_id.clone()));
                }
                return Ok(core);
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return Err(LatticeError::ObjectNotFound(object_id.clone())),
                Err(_) => return Err(LatticeError::Timeout(timeout)),
            }
        }
    }

    /// Tombstone a registered object.
    pub fn remove(&self, core: &Arc<ObjectCore>) -> Result<()> {
        {
            let objects = self.inner.objects.lock().unwrap();
            if !objects.contains_key(core.id()) {
                return Err(LatticeError::ObjectNotFound(core.id().clone()));
            }
        }
        core.set_deleted(true)
    }

    /// Ids of every object in the space, loaded or not: the union of the
    /// root document's inline objects and link table.
    pub fn all_object_ids(&self) -> Vec<ObjectId> {
        if !self.is_open() {
            return Vec::new();
        }
        let Ok(root) = self.inner.loader.get_space_root_doc_handle() else {
            return Vec::new();
        };
        let Some(doc) = root.doc_sync() else {
            return Vec::new();
        };
        let mut ids: BTreeSet<ObjectId> = doc.objects.keys().cloned().collect();
        ids.extend(doc.links.keys().cloned());
        ids.into_iter().collect()
    }

    /// All currently loaded binding cores.
    pub fn all_object_cores(&self) -> Vec<Arc<ObjectCore>> {
        self.inner.objects.lock().unwrap().values().cloned().collect()
    }

    /// Subscribe to object update notifications.
    pub fn on_update(&self, callback: Callback<ItemsUpdated>) -> CallbackSubscription<ItemsUpdated> {
        self.inner.update_event.subscribe(callback)
    }

    /// Subscribe to root document changes (root swap via
    /// [`update`](SpaceDb::update)).
    pub fn on_root_changed(&self, callback: Callback<()>) -> CallbackSubscription<()> {
        self.inner.root_changed.subscribe(callback)
    }

    /// Persist snapshots of every document tracked by the loader.
    pub fn flush(&self) -> Result<()> {
        for handle in self.inner.loader.all_handles() {
            handle.save()?;
        }
        Ok(())
    }

    /// Update the registry in response to a space state change. Swaps the
    /// root document: surviving objects are rebound, objects absent from the
    /// new root are dropped, and previously tracked loads are re-issued.
    pub async fn update(&self, space_state: &SpaceState) -> Result<()> {
        let current_root = self.inner.loader.get_space_root_doc_handle()?;
        if space_state.root_url.as_ref() == Some(current_root.url()) {
            return Ok(());
        }
        let scope = self.inner.scope.lock().unwrap().clone();

        self.inner.subscriptions.lock().unwrap().clear();
        let to_reload = self.inner.loader.clear_handle_references();

        match self
            .inner
            .loader
            .load_space_root_doc_handle(&scope, space_state)
            .await
        {
            Ok(_) => {}
            Err(LatticeError::Cancelled) => {
                log::debug!("space {} was closed during root swap", self.inner.space_key);
                return Ok(());
            }
            Err(err) => {
                log::error!(
                    "failed to swap root document for space {}: {}",
                    self.inner.space_key,
                    err
                );
                return Err(err);
            }
        }

        let root = self.inner.loader.get_space_root_doc_handle()?;
        let root_doc = root.doc_sync().ok_or(LatticeError::NotReady)?;
        let inlined: HashSet<ObjectId> = root_doc.objects.keys().cloned().collect();
        let links = root_doc.links.clone();

        let existing: Vec<Arc<ObjectCore>> = {
            let objects = self.inner.objects.lock().unwrap();
            objects.values().cloned().collect()
        };

        let mut to_remove: Vec<ObjectId> = Vec::new();
        let mut root_rebinds: Vec<ObjectId> = Vec::new();
        let mut link_rebinds: BTreeMap<DocUrl, Vec<ObjectId>> = BTreeMap::new();
        for core in &existing {
            let object_id = core.id().clone();
            let bound_url = core.doc_handle().map(|handle| handle.url().clone());
            if inlined.contains(&object_id) {
                if bound_url.as_ref() != Some(root.url()) {
                    root_rebinds.push(object_id);
                }
            } else if let Some(url) = links.get(&object_id) {
                if bound_url.as_ref() != Some(url) {
                    link_rebinds.entry(url.clone()).or_default().push(object_id);
                }
            } else {
                to_remove.push(object_id);
            }
        }

        let to_create: Vec<ObjectId> = root_doc
            .objects
            .keys()
            .filter(|object_id| {
                let objects = self.inner.objects.lock().unwrap();
                !objects.contains_key(*object_id)
            })
            .cloned()
            .collect();

        {
            let mut objects = self.inner.objects.lock().unwrap();
            for object_id in &to_remove {
                log::debug!(
                    "dropping object {} absent from the new root document",
                    object_id
                );
                objects.remove(object_id);
            }
        }

        for object_id in &to_create {
            DbInner::create_object_in_document(&self.inner, &root, object_id);
        }
        DbInner::rebind_objects(&self.inner, &root, &root_rebinds);

        for (url, object_ids) in link_rebinds {
            let handle = self.inner.context.repo().find(&url);
            tokio::select! {
                _ = scope.cancelled() => return Err(LatticeError::Cancelled),
                ready = handle.when_ready() => ready?,
            }
            DbInner::subscribe_to_handle(&self.inner, &handle);
            DbInner::rebind_objects(&self.inner, &handle, &object_ids);
        }

        for object_id in to_reload {
            let known = {
                let objects = self.inner.objects.lock().unwrap();
                objects.contains_key(&object_id)
            };
            if !known {
                let _ = self.inner.loader.load_object_document(&[object_id]);
            }
        }
        self.inner.loader.load_linked_objects(&links);

        DbInner::subscribe_to_handle(&self.inner, &root);
        self.inner.root_changed.emit(&());
        Ok(())
    }
}

impl std::fmt::Debug for SpaceDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceDb")
            .field("space_key", &self.inner.space_key)
            .field("objects", &self.inner.objects.lock().unwrap().len())
            .field("open", &self.is_open())
            .finish()
    }
}

impl DbInner {
    /// Keep document change handling alive for a handle for as long as the
    /// registry exists; the weak reference breaks the cycle between handles
    /// and the registry.
    fn subscribe_to_handle(inner: &Arc<DbInner>, handle: &DocHandle) {
        let weak = Arc::downgrade(inner);
        let subscription = handle.on_change(Arc::new(move |event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                DbInner::on_document_update(&inner, event);
            }
        }));
        inner.subscriptions.lock().unwrap().push(subscription);
    }

    fn on_document_update(inner: &Arc<DbInner>, event: &ChangeEvent) {
        let changes = inner.loader.process_document_update(event);
        DbInner::rebind_objects(inner, &event.handle, &changes.objects_to_rebind);
        inner.loader.load_linked_objects(&changes.linked_documents);
        for object_id in &changes.created_object_ids {
            DbInner::create_object_in_document(inner, &event.handle, object_id);
        }
        DbInner::emit_update(inner, changes.updated_object_ids);
    }

    /// Creates binding cores for objects discovered in a document: inline
    /// objects at open, objects created by other clients, and loaded linked
    /// documents.
    fn create_object_in_document(inner: &Arc<DbInner>, handle: &DocHandle, object_id: &ObjectId) {
        {
            let objects = inner.objects.lock().unwrap();
            if objects.contains_key(object_id) {
                log::debug!("object {} already registered; skipping create", object_id);
                return;
            }
        }
        let core = Arc::new(ObjectCore::with_id(object_id.clone()));
        inner
            .objects
            .lock()
            .unwrap()
            .insert(object_id.clone(), Arc::clone(&core));
        inner.loader.on_object_created_in_document(handle, object_id);
        let bind = core.bind(BindOptions {
            handle: handle.clone(),
            path: vec!["objects".to_string(), object_id.to_string()],
            assign_from_local_state: false,
        });
        if let Err(err) = bind {
            log::error!(
                "failed to bind discovered object {} to {}: {}",
                object_id,
                handle.url(),
                err
            );
        }
    }

    fn rebind_objects(inner: &Arc<DbInner>, handle: &DocHandle, object_ids: &[ObjectId]) {
        for object_id in object_ids {
            let core = {
                let objects = inner.objects.lock().unwrap();
                objects.get(object_id).cloned()
            };
            let Some(core) = core else {
                log::warn!("cannot rebind unknown object {}", object_id);
                continue;
            };
            let mut path = core.mount_path();
            if path.is_empty() {
                path = vec!["objects".to_string(), object_id.to_string()];
            }
            if let Err(err) = core.bind(BindOptions {
                handle: handle.clone(),
                path,
                assign_from_local_state: false,
            }) {
                log::error!(
                    "failed to rebind object {} to {}: {}",
                    object_id,
                    handle.url(),
                    err
                );
                continue;
            }
            inner.loader.on_object_rebound(handle, object_id);
        }
    }

    fn handle_object_document_loaded(inner: &Arc<DbInner>, loaded: &ObjectDocumentLoaded) {
        DbInner::subscribe_to_handle(inner, &loaded.handle);
        DbInner::create_object_in_document(inner, &loaded.handle, &loaded.object_id);
        DbInner::emit_update(inner, vec![loaded.object_id.clone()]);
    }

    fn emit_update(inner: &Arc<DbInner>, ids: Vec<ObjectId>) {
        if ids.is_empty() {
            return;
        }
        for object_id in &ids {
            let core = {
                let objects = inner.objects.lock().unwrap();
                objects.get(object_id).cloned()
            };
            if let Some(core) = core {
                core.notify_update();
            }
        }
        inner.update_event.emit(&ItemsUpdated { ids });
    }
}
