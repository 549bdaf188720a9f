//! Per-space document loader.
//!
//! The loader is the state machine that decides which document currently
//! owns which object. It loads the space's root document, creates and loads
//! per-object linked documents, and classifies document change events into
//! object-level created / updated / needs-rebind outcomes.
//!
//! The believed-current handle table is updated synchronously at the moment
//! a link is observed or created, before any asynchronous wait begins. A
//! slower load completing after a rebind therefore sees that its handle no
//! longer matches the current one and discards its result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::SpaceConfig;
use crate::engine::{ChangeEvent, DocHandle, DocRepo};
use crate::error::{LatticeError, Result};
use crate::event::{Callback, CallbackRegistry, CallbackSubscription};
use crate::scope::Scope;
use crate::types::{DocUrl, ObjectId, SpaceKey, SpaceState};

/// Outcome of a root document load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootDocLoad {
    /// The root document was found and is ready (or was already
    /// initialized).
    Loaded,
    /// No root URL was supplied; a fresh document was created and bound to
    /// the cancellation scope (local-only draft space).
    Created,
    /// The root could not be loaded and a fresh fallback document was
    /// created instead.
    Degraded {
        /// Why the original root load failed.
        reason: String,
    },
}

/// Notification that a linked document finished loading for an object that
/// is still bound to it.
#[derive(Clone)]
pub struct ObjectDocumentLoaded {
    /// The loaded document.
    pub handle: DocHandle,
    /// The object the document was loaded for.
    pub object_id: ObjectId,
}

/// Object-level classification of one document change event.
#[derive(Debug, Clone, Default)]
pub struct DocumentChanges {
    /// Objects whose inline state changed in the event's document.
    pub updated_object_ids: Vec<ObjectId>,
    /// Changed objects not yet known to be created.
    pub created_object_ids: Vec<ObjectId>,
    /// Created objects whose recorded document differs from the event's
    /// document: they moved without the loader's prior knowledge.
    pub objects_to_rebind: Vec<ObjectId>,
    /// Newly established links.
    pub linked_documents: BTreeMap<ObjectId, DocUrl>,
}

/// Per-space loader state machine.
///
/// Cloning is cheap and shares the state.
#[derive(Clone)]
pub struct DocumentLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    space_key: SpaceKey,
    repo: DocRepo,
    config: SpaceConfig,
    root_handle: Mutex<Option<DocHandle>>,
    /// Believed-current document for every object that is created or whose
    /// document is being loaded.
    object_doc_handles: Mutex<HashMap<ObjectId, DocHandle>>,
    /// Objects known to have completed creation, as opposed to being
    /// mid-load.
    created_object_ids: Mutex<HashSet<ObjectId>>,
    loaded_observers: CallbackRegistry<ObjectDocumentLoaded>,
}

impl DocumentLoader {
    /// Create a loader for a space.
    pub fn new(space_key: SpaceKey, repo: DocRepo, config: SpaceConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                space_key,
                repo,
                config,
                root_handle: Mutex::new(None),
                object_doc_handles: Mutex::new(HashMap::new()),
                created_object_ids: Mutex::new(HashSet::new()),
                loaded_observers: CallbackRegistry::new(),
            }),
        }
    }

    /// Register an observer for completed linked-document loads.
    pub fn on_object_document_loaded(
        &self,
        callback: Callback<ObjectDocumentLoaded>,
    ) -> CallbackSubscription<ObjectDocumentLoaded> {
        self.inner.loaded_observers.subscribe(callback)
    }

    /// Drop all document-loaded observers.
    ///
    /// Pending load completions check registration before acting, so this is
    /// the space-close cancellation point for in-flight loads.
    pub fn clear_document_loaded_observers(&self) {
        self.inner.loaded_observers.clear();
    }

    /// Load and initialize the space's root document handle.
    ///
    /// Idempotent: an already-initialized, non-deleted root is left alone.
    /// Without a `root_url` a fresh document is created, stamped with the
    /// space key, and bound to the scope so it is deleted if the scope is
    /// disposed before the space is promoted to durable state. Load failures
    /// fall back to a fresh document unless strict mode is active; scope
    /// disposal always propagates as [`LatticeError::Cancelled`].
    pub async fn load_space_root_doc_handle(
        &self,
        scope: &Scope,
        space_state: &SpaceState,
    ) -> Result<RootDocLoad> {
        if scope.is_disposed() {
            return Err(LatticeError::Cancelled);
        }
        {
            let root = self.inner.root_handle.lock().unwrap();
            if let Some(handle) = root.as_ref() {
                if !handle.is_deleted() {
                    log::debug!("space root handle {} already initialized", handle.url());
                    return Ok(RootDocLoad::Loaded);
                }
            }
        }

        let Some(url) = &space_state.root_url else {
            if self.inner.config.strict_root_load {
                log::error!(
                    "space {} has no root document url; creating a local draft document",
                    self.inner.space_key
                );
            } else {
                log::warn!(
                    "space {} has no root document url; creating a local draft document",
                    self.inner.space_key
                );
            }
            let handle = self.create_scope_bound_doc(scope)?;
            *self.inner.root_handle.lock().unwrap() = Some(handle);
            return Ok(RootDocLoad::Created);
        };

        let handle = self.inner.repo.find(url);
        match self.await_root_ready(scope, &handle).await {
            Ok(()) => {
                self.stamp_access_if_missing(&handle)?;
                *self.inner.root_handle.lock().unwrap() = Some(handle);
                Ok(RootDocLoad::Loaded)
            }
            Err(LatticeError::Cancelled) => Err(LatticeError::Cancelled),
            Err(err) if self.inner.config.strict_root_load => Err(err),
            Err(err) => {
                log::warn!(
                    "falling back to a fresh document for space {} after failed load of {}: {}",
                    self.inner.space_key,
                    url,
                    err
                );
                let handle = self.create_scope_bound_doc(scope)?;
                *self.inner.root_handle.lock().unwrap() = Some(handle);
                Ok(RootDocLoad::Degraded {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn await_root_ready(&self, scope: &Scope, handle: &DocHandle) -> Result<()> {
        let per_attempt = self.inner.config.root_load_timeout;
        loop {
            tokio::select! {
                _ = scope.cancelled() => return Err(LatticeError::Cancelled),
                waited = tokio::time::timeout(per_attempt, handle.when_ready()) => match waited {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(err)) => return Err(err),
                    Err(_) if self.inner.config.strict_root_load => {
                        // Timeouts are expected transients in production; keep waiting.
                        log::error!(
                            "timed out waiting for space root document {}; retrying",
                            handle.url()
                        );
                    }
                    Err(_) => {
                        return Err(LatticeError::LoadTimeout {
                            url: handle.url().clone(),
                        });
                    }
                }
            }
        }
    }

    fn create_scope_bound_doc(&self, scope: &Scope) -> Result<DocHandle> {
        let handle = self.inner.repo.create()?;
        handle.change(|doc| doc.set_access(&self.inner.space_key))?;
        let ephemeral = handle.clone();
        scope.on_dispose(move || {
            if let Err(err) = ephemeral.delete() {
                log::warn!(
                    "failed to delete scope-bound document {}: {}",
                    ephemeral.url(),
                    err
                );
            }
        });
        Ok(handle)
    }

    /// Handles documents created by a peer that raced the access-stamping
    /// step.
    fn stamp_access_if_missing(&self, handle: &DocHandle) -> Result<()> {
        let doc = handle.doc_sync().ok_or(LatticeError::NotReady)?;
        if doc.access.is_none() {
            log::debug!("stamping access on root document {}", handle.url());
            handle.change(|doc| doc.set_access(&self.inner.space_key))?;
        }
        Ok(())
    }

    /// The space's root document handle.
    pub fn get_space_root_doc_handle(&self) -> Result<DocHandle> {
        self.inner
            .root_handle
            .lock()
            .unwrap()
            .clone()
            .ok_or(LatticeError::RootNotLoaded)
    }

    /// Allocate a new linked document for an object.
    ///
    /// Stamps the document's access record and, within one root-document
    /// mutation, records `links[object_id] = url`. The caller is responsible
    /// for writing the object structure into the new document.
    pub fn create_document_for_object(&self, object_id: &ObjectId) -> Result<DocHandle> {
        let root = self.get_space_root_doc_handle()?;
        let handle = self.inner.repo.create()?;
        handle.change(|doc| doc.set_access(&self.inner.space_key))?;

        // Record the binding before the link is visible to change listeners.
        self.record_binding(&handle, object_id, true);
        root.change(|doc| doc.set_link(object_id, handle.url()))?;
        Ok(handle)
    }

    /// Start loading the documents behind a set of links.
    ///
    /// Links already resolved to the same document are skipped; links
    /// disagreeing with an existing binding are flagged and skipped. For the
    /// rest the handle is recorded synchronously, then readiness is awaited
    /// in the background.
    pub fn load_linked_objects(&self, links: &BTreeMap<ObjectId, DocUrl>) {
        for (object_id, url) in links {
            let existing = {
                let handles = self.inner.object_doc_handles.lock().unwrap();
                handles.get(object_id).cloned()
            };
            if let Some(handle) = existing {
                if handle.url() == url {
                    log::debug!("object {} already resolved to {}", object_id, url);
                } else {
                    // Link table and actual inline location disagree; tolerated but flagged.
                    log::warn!(
                        "object {} is already bound to {}; ignoring link to {}",
                        object_id,
                        handle.url(),
                        url
                    );
                }
                continue;
            }

            let handle = self.inner.repo.find(url);
            self.inner
                .object_doc_handles
                .lock()
                .unwrap()
                .insert(object_id.clone(), handle.clone());

            let inner = Arc::clone(&self.inner);
            let object_id = object_id.clone();
            tokio::spawn(async move {
                drive_object_load(inner, handle, object_id).await;
            });
        }
    }

    /// Start loading the documents for objects via the root link table.
    ///
    /// The lazy-loading entry point used by the registry when an unknown id
    /// is requested.
    pub fn load_object_document(&self, object_ids: &[ObjectId]) -> Result<()> {
        let root = self.get_space_root_doc_handle()?;
        let doc = root.doc_sync().ok_or(LatticeError::NotReady)?;
        let mut links = BTreeMap::new();
        for object_id in object_ids {
            match doc.links.get(object_id) {
                Some(url) => {
                    links.insert(object_id.clone(), url.clone());
                }
                None => {
                    log::debug!(
                        "no link for object {} in root document; nothing to load",
                        object_id
                    );
                }
            }
        }
        self.load_linked_objects(&links);
        Ok(())
    }

    /// Record that an object was authored into a document here.
    pub fn on_object_created_in_document(&self, handle: &DocHandle, object_id: &ObjectId) {
        self.record_binding(handle, object_id, true);
    }

    /// Record that an object moved to a different document.
    pub fn on_object_rebound(&self, handle: &DocHandle, object_id: &ObjectId) {
        self.record_binding(handle, object_id, false);
    }

    fn record_binding(&self, handle: &DocHandle, object_id: &ObjectId, mark_created: bool) {
        self.inner
            .object_doc_handles
            .lock()
            .unwrap()
            .insert(object_id.clone(), handle.clone());
        if mark_created {
            self.inner
                .created_object_ids
                .lock()
                .unwrap()
                .insert(object_id.clone());
        }
    }

    /// Classify a document change event into object-level outcomes.
    ///
    /// Pure with respect to loader state: the caller decides how to act on
    /// the returned classification.
    pub fn process_document_update(&self, event: &ChangeEvent) -> DocumentChanges {
        let mut changes = DocumentChanges::default();
        let created = self.inner.created_object_ids.lock().unwrap();
        let handles = self.inner.object_doc_handles.lock().unwrap();

        for patch in &event.patches {
            let head = patch.path.first().and_then(|segment| segment.as_key());
            let second = patch.path.get(1).and_then(|segment| segment.as_key());
            let (Some(head), Some(second)) = (head, second) else {
                continue;
            };
            match head {
                "objects" => {
                    let object_id = ObjectId::from(second);
                    if !changes.updated_object_ids.contains(&object_id) {
                        changes.updated_object_ids.push(object_id.clone());
                    }
                    if !created.contains(&object_id) {
                        if !changes.created_object_ids.contains(&object_id) {
                            changes.created_object_ids.push(object_id);
                        }
                    } else if let Some(current) = handles.get(&object_id) {
                        if current.url() != event.handle.url()
                            && !changes.objects_to_rebind.contains(&object_id)
                        {
                            log::warn!(
                                "object {} is bound to {} but changed inline in {}; scheduling rebind",
                                object_id,
                                current.url(),
                                event.handle.url()
                            );
                            changes.objects_to_rebind.push(object_id);
                        }
                    }
                }
                "links" => {
                    if let Some(serde_json::Value::String(raw)) = &patch.value {
                        match DocUrl::parse(raw) {
                            Some(url) => {
                                changes.linked_documents.insert(ObjectId::from(second), url);
                            }
                            None => {
                                log::warn!(
                                    "ignoring link for object {} with invalid document url {:?}",
                                    second,
                                    raw
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        changes
    }

    /// Drop the root handle and every per-object binding, returning the ids
    /// that were tracked. Used when the space's root document is swapped.
    pub fn clear_handle_references(&self) -> Vec<ObjectId> {
        *self.inner.root_handle.lock().unwrap() = None;
        let mut handles = self.inner.object_doc_handles.lock().unwrap();
        let object_ids: Vec<ObjectId> = handles.keys().cloned().collect();
        handles.clear();
        object_ids
    }

    /// Every handle currently tracked by the loader (root plus per-object),
    /// deduplicated by URL.
    pub fn all_handles(&self) -> Vec<DocHandle> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        if let Some(root) = self.inner.root_handle.lock().unwrap().clone() {
            seen.insert(root.url().clone());
            result.push(root);
        }
        for handle in self.inner.object_doc_handles.lock().unwrap().values() {
            if seen.insert(handle.url().clone()) {
                result.push(handle.clone());
            }
        }
        result
    }

    /// The document currently believed to own an object, if tracked.
    pub fn object_doc_handle(&self, object_id: &ObjectId) -> Option<DocHandle> {
        self.inner
            .object_doc_handles
            .lock()
            .unwrap()
            .get(object_id)
            .cloned()
    }
}

impl std::fmt::Debug for DocumentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLoader")
            .field("space_key", &self.inner.space_key)
            .field(
                "tracked_objects",
                &self.inner.object_doc_handles.lock().unwrap().len(),
            )
            .finish()
    }
}

/// Await a linked document's readiness, then notify observers if the object
/// is still bound to the same handle and anyone is still listening.
async fn drive_object_load(inner: Arc<LoaderInner>, handle: DocHandle, object_id: ObjectId) {
    loop {
        if !inner.loaded_observers.has_subscribers() {
            log::debug!(
                "no document-loaded observers remain; abandoning load of {} for object {}",
                handle.url(),
                object_id
            );
            return;
        }
        match tokio::time::timeout(inner.config.load_retry_interval, handle.when_ready()).await {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                log::warn!(
                    "document {} for object {} became unavailable: {}",
                    handle.url(),
                    object_id,
                    err
                );
                return;
            }
            Err(_) => {
                log::debug!(
                    "document {} for object {} still loading; retrying",
                    handle.url(),
                    object_id
                );
            }
        }
    }

    let still_bound = {
        let handles = inner.object_doc_handles.lock().unwrap();
        handles
            .get(&object_id)
            .map(|current| current.url() == handle.url())
            .unwrap_or(false)
    };
    if !still_bound {
        log::warn!(
            "object {} was rebound while {} was loading; dropping the result",
            object_id,
            handle.url()
        );
        return;
    }
    if !inner.loaded_observers.has_subscribers() {
        return;
    }
    inner
        .loaded_observers
        .emit(&ObjectDocumentLoaded { handle, object_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BoxFuture, DocFetcher, DocStorage, FetchResult, MemoryStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn quick_config() -> SpaceConfig {
        SpaceConfig {
            root_load_timeout: Duration::from_millis(100),
            load_retry_interval: Duration::from_millis(20),
            ..SpaceConfig::default()
        }
    }

    fn test_loader() -> (DocumentLoader, DocRepo) {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let repo = DocRepo::new(storage);
        let loader = DocumentLoader::new(SpaceKey::random(), repo.clone(), quick_config());
        (loader, repo)
    }

    /// Fetcher that never resolves on its own; loads complete only through
    /// `DocRepo::apply_remote`.
    struct PendingFetcher;

    impl DocFetcher for PendingFetcher {
        fn fetch<'a>(&'a self, _url: &'a DocUrl) -> BoxFuture<'a, crate::error::Result<FetchResult>> {
            Box::pin(async move { Ok(FetchResult::Pending) })
        }
    }

    fn pending_loader() -> (DocumentLoader, DocRepo) {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let repo = DocRepo::with_fetcher(storage, Arc::new(PendingFetcher));
        let loader = DocumentLoader::new(SpaceKey::random(), repo.clone(), quick_config());
        (loader, repo)
    }

    #[tokio::test]
    async fn test_root_load_without_url_creates_stamped_doc() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();

        let outcome = loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        assert_eq!(outcome, RootDocLoad::Created);

        let root = loader.get_space_root_doc_handle().unwrap();
        let doc = root.doc_sync().unwrap();
        assert_eq!(
            doc.access.unwrap().space_key,
            loader.inner.space_key.clone()
        );
    }

    #[tokio::test]
    async fn test_root_load_is_idempotent() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();

        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        let first = loader.get_space_root_doc_handle().unwrap();

        let outcome = loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        assert_eq!(outcome, RootDocLoad::Loaded);
        let second = loader.get_space_root_doc_handle().unwrap();
        assert_eq!(first.url(), second.url());
    }

    #[tokio::test]
    async fn test_scope_disposal_deletes_draft_root() {
        let (loader, repo) = test_loader();
        let scope = Scope::new();

        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        let root = loader.get_space_root_doc_handle().unwrap();
        assert!(!root.is_deleted());

        scope.dispose();
        assert!(root.is_deleted());
        let _ = repo;
    }

    #[tokio::test]
    async fn test_unavailable_root_falls_back_when_not_strict() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();
        let state = SpaceState {
            root_url: Some(DocUrl::random()),
        };

        let outcome = loader
            .load_space_root_doc_handle(&scope, &state)
            .await
            .unwrap();
        assert!(matches!(outcome, RootDocLoad::Degraded { .. }));
        assert!(loader.get_space_root_doc_handle().is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_root_propagates_in_strict_mode() {
        let storage: Arc<dyn DocStorage> = Arc::new(MemoryStorage::new());
        let repo = DocRepo::new(storage);
        let config = SpaceConfig {
            strict_root_load: true,
            ..quick_config()
        };
        let loader = DocumentLoader::new(SpaceKey::random(), repo, config);
        let scope = Scope::new();
        let state = SpaceState {
            root_url: Some(DocUrl::random()),
        };

        let result = loader.load_space_root_doc_handle(&scope, &state).await;
        assert!(matches!(
            result,
            Err(LatticeError::DocumentUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_scope_disposal_propagates_as_cancelled() {
        let (loader, _repo) = pending_loader();
        let scope = Scope::new();
        scope.dispose();

        let result = loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await;
        assert!(matches!(result, Err(LatticeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_create_document_for_object_links_root() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();
        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();

        let object_id = ObjectId::from("obj-1");
        let handle = loader.create_document_for_object(&object_id).unwrap();

        let root = loader.get_space_root_doc_handle().unwrap();
        let root_doc = root.doc_sync().unwrap();
        assert_eq!(root_doc.links.get(&object_id), Some(handle.url()));
        assert_eq!(
            handle.doc_sync().unwrap().access.unwrap().space_key,
            loader.inner.space_key.clone()
        );
    }

    #[tokio::test]
    async fn test_load_linked_objects_same_url_loads_once() {
        let (loader, repo) = pending_loader();
        let url = DocUrl::random();
        let object_id = ObjectId::from("obj-2");

        let mut links = BTreeMap::new();
        links.insert(object_id.clone(), url.clone());
        loader.load_linked_objects(&links);
        let first = loader.object_doc_handle(&object_id).unwrap();

        loader.load_linked_objects(&links);
        let second = loader.object_doc_handle(&object_id).unwrap();
        assert_eq!(first.url(), second.url());
        // Still a single cached handle in the repo for that url.
        assert!(repo.get(&url).is_some());
    }

    #[tokio::test]
    async fn test_link_for_object_bound_elsewhere_is_skipped() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();
        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        let root = loader.get_space_root_doc_handle().unwrap();

        let object_id = ObjectId::from("obj-3");
        loader.on_object_created_in_document(&root, &object_id);

        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        let _sub = loader.on_object_document_loaded(Arc::new(move |_: &ObjectDocumentLoaded| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        let mut links = BTreeMap::new();
        links.insert(object_id.clone(), DocUrl::random());
        loader.load_linked_objects(&links);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Binding must be unchanged and no spurious loaded event emitted.
        let current = loader.object_doc_handle(&object_id).unwrap();
        assert_eq!(current.url(), root.url());
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rebind_race_drops_stale_load() {
        let (loader, repo) = pending_loader();
        let object_id = ObjectId::from("obj-4");
        let slow_url = DocUrl::random();

        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        let _sub = loader.on_object_document_loaded(Arc::new(move |_: &ObjectDocumentLoaded| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        // Start loading from document A.
        let mut links = BTreeMap::new();
        links.insert(object_id.clone(), slow_url.clone());
        loader.load_linked_objects(&links);

        // Rebind to document B before A's load completes.
        let other = repo.create().unwrap();
        loader.on_object_rebound(&other, &object_id);

        // Now let A's load finish.
        let stale = repo.get(&slow_url).unwrap();
        stale.set_state(crate::engine::HandleState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The stale completion must not notify observers.
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        let current = loader.object_doc_handle(&object_id).unwrap();
        assert_eq!(current.url(), other.url());
    }

    #[tokio::test]
    async fn test_load_completion_notifies_when_still_bound() {
        let (loader, repo) = pending_loader();
        let object_id = ObjectId::from("obj-5");
        let url = DocUrl::random();

        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        let _sub = loader.on_object_document_loaded(Arc::new(move |loaded: &ObjectDocumentLoaded| {
            assert_eq!(loaded.object_id, ObjectId::from("obj-5"));
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        let mut links = BTreeMap::new();
        links.insert(object_id.clone(), url.clone());
        loader.load_linked_objects(&links);

        let handle = repo.get(&url).unwrap();
        handle.set_state(crate::engine::HandleState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleared_observers_drop_pending_loads() {
        let (loader, repo) = pending_loader();
        let object_id = ObjectId::from("obj-6");
        let url = DocUrl::random();

        let notified = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&notified);
        let sub = loader.on_object_document_loaded(Arc::new(move |_: &ObjectDocumentLoaded| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        let mut links = BTreeMap::new();
        links.insert(object_id.clone(), url.clone());
        loader.load_linked_objects(&links);

        drop(sub);
        loader.clear_document_loaded_observers();

        let handle = repo.get(&url).unwrap();
        handle.set_state(crate::engine::HandleState::Ready);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_document_update_classifies_patches() {
        let (loader, repo) = test_loader();
        let scope = Scope::new();
        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        let root = loader.get_space_root_doc_handle().unwrap();

        let known = ObjectId::from("known");
        let fresh = ObjectId::from("fresh");
        let moved = ObjectId::from("moved");
        let linked = ObjectId::from("linked");
        let linked_url = DocUrl::random();

        loader.on_object_created_in_document(&root, &known);
        let elsewhere = repo.create().unwrap();
        loader.on_object_created_in_document(&elsewhere, &moved);

        use crate::types::{Patch, PathSegment};
        let event = ChangeEvent {
            handle: root.clone(),
            patches: vec![
                Patch {
                    path: vec![PathSegment::from("objects"), PathSegment::from("known")],
                    value: Some(serde_json::json!({})),
                },
                Patch {
                    path: vec![PathSegment::from("objects"), PathSegment::from("fresh")],
                    value: Some(serde_json::json!({})),
                },
                Patch {
                    path: vec![PathSegment::from("objects"), PathSegment::from("moved")],
                    value: Some(serde_json::json!({})),
                },
                Patch {
                    path: vec![PathSegment::from("links"), PathSegment::from("linked")],
                    value: Some(serde_json::Value::String(linked_url.as_str().to_string())),
                },
                Patch {
                    path: vec![PathSegment::from("links"), PathSegment::from("bogus")],
                    value: Some(serde_json::Value::String("not-a-url".to_string())),
                },
                Patch {
                    path: vec![PathSegment::from("access")],
                    value: None,
                },
            ],
        };

        let changes = loader.process_document_update(&event);
        assert_eq!(changes.updated_object_ids.len(), 3);
        assert_eq!(changes.created_object_ids, vec![fresh]);
        assert_eq!(changes.objects_to_rebind, vec![moved]);
        assert_eq!(changes.linked_documents.get(&linked), Some(&linked_url));
        assert!(!changes.linked_documents.contains_key(&ObjectId::from("bogus")));
    }

    #[tokio::test]
    async fn test_clear_handle_references_returns_tracked_ids() {
        let (loader, _repo) = test_loader();
        let scope = Scope::new();
        loader
            .load_space_root_doc_handle(&scope, &SpaceState::default())
            .await
            .unwrap();
        let root = loader.get_space_root_doc_handle().unwrap();
        let object_id = ObjectId::from("obj-7");
        loader.on_object_created_in_document(&root, &object_id);

        let cleared = loader.clear_handle_references();
        assert_eq!(cleared, vec![object_id.clone()]);
        assert!(loader.get_space_root_doc_handle().is_err());
        assert!(loader.object_doc_handle(&object_id).is_none());
    }
}
