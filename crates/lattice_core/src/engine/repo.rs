//! Document repo: URL-addressed handle cache for one engine session.
//!
//! The repo resolves [`DocHandle`]s by URL: cached handles are returned
//! directly, otherwise a `Loading` handle is created and resolved in the
//! background by a [`DocFetcher`]. Lookups use double-checked locking so a
//! URL resolves to exactly one live handle per session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::BoxFuture;
use super::handle::{DocHandle, DocUpdated, HandleState};
use super::storage::DocStorage;
use crate::error::Result;
use crate::event::{Callback, CallbackRegistry, CallbackSubscription};
use crate::types::{DocUrl, UpdateOrigin};

/// Outcome of fetching a document's payloads by URL.
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// The document was found; payloads to apply in order (snapshot first,
    /// then incremental updates).
    Found(Vec<Vec<u8>>),
    /// The document definitively does not exist at this source.
    Unavailable,
    /// The source cannot answer now; resolution will arrive out of band
    /// (e.g. pushed over a relay bridge).
    Pending,
}

/// Async source of document payloads.
///
/// Object-safe so it can be used behind `dyn DocFetcher`; methods return
/// boxed futures.
pub trait DocFetcher: Send + Sync {
    /// Resolve a URL to document payloads.
    fn fetch<'a>(&'a self, url: &'a DocUrl) -> BoxFuture<'a, Result<FetchResult>>;
}

/// Default fetcher: reads the snapshot and update log from storage.
pub struct StorageFetcher {
    storage: Arc<dyn DocStorage>,
}

impl StorageFetcher {
    /// Create a fetcher over a storage backend.
    pub fn new(storage: Arc<dyn DocStorage>) -> Self {
        Self { storage }
    }
}

impl DocFetcher for StorageFetcher {
    fn fetch<'a>(&'a self, url: &'a DocUrl) -> BoxFuture<'a, Result<FetchResult>> {
        Box::pin(async move {
            let mut payloads = Vec::new();
            if let Some(snapshot) = self.storage.load_doc(url.as_str())? {
                payloads.push(snapshot);
            }
            for record in self.storage.get_all_updates(url.as_str())? {
                payloads.push(record.data);
            }
            if payloads.is_empty() {
                Ok(FetchResult::Unavailable)
            } else {
                Ok(FetchResult::Found(payloads))
            }
        })
    }
}

/// Handle cache for one engine session.
///
/// Cloning is cheap and shares the session.
#[derive(Clone)]
pub struct DocRepo {
    inner: Arc<RepoInner>,
}

struct RepoInner {
    storage: Arc<dyn DocStorage>,
    fetcher: Arc<dyn DocFetcher>,
    handles: Mutex<HashMap<DocUrl, DocHandle>>,
    local_updates: CallbackRegistry<DocUpdated>,
    /// When set, a storage miss leaves the handle `Loading` instead of
    /// marking it `Unavailable`: a relay bridge may still deliver it.
    network_backed: AtomicBool,
}

impl DocRepo {
    /// Create a repo resolving documents from the given storage backend.
    pub fn new(storage: Arc<dyn DocStorage>) -> Self {
        let fetcher = Arc::new(StorageFetcher::new(Arc::clone(&storage)));
        Self::with_fetcher(storage, fetcher)
    }

    /// Create a repo with a custom fetch source.
    pub fn with_fetcher(storage: Arc<dyn DocStorage>, fetcher: Arc<dyn DocFetcher>) -> Self {
        Self {
            inner: Arc::new(RepoInner {
                storage,
                fetcher,
                handles: Mutex::new(HashMap::new()),
                local_updates: CallbackRegistry::new(),
                network_backed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn set_network_backed(&self, value: bool) {
        self.inner.network_backed.store(value, Ordering::SeqCst);
    }

    /// Allocate a fresh empty document and return its handle.
    ///
    /// The document is persisted immediately so peers sharing the storage
    /// backend can find it.
    pub fn create(&self) -> Result<DocHandle> {
        let url = DocUrl::random();
        let handle = DocHandle::new(
            url.clone(),
            HandleState::Ready,
            Arc::clone(&self.inner.storage),
            self.inner.local_updates.clone(),
        );
        handle.save()?;
        self.inner.handles.lock().unwrap().insert(url, handle.clone());
        Ok(handle)
    }

    /// Resolve a handle by URL.
    ///
    /// Returns the cached handle if one exists; otherwise a `Loading` handle
    /// whose resolution is driven in the background. Must be called within a
    /// tokio runtime.
    pub fn find(&self, url: &DocUrl) -> DocHandle {
        // Fast path: check cache with the lock held briefly
        {
            let handles = self.inner.handles.lock().unwrap();
            if let Some(handle) = handles.get(url) {
                return handle.clone();
            }
        }

        let handle = DocHandle::new(
            url.clone(),
            HandleState::Loading,
            Arc::clone(&self.inner.storage),
            self.inner.local_updates.clone(),
        );

        {
            let mut handles = self.inner.handles.lock().unwrap();
            // Double-check: another caller may have inserted while we built ours
            if let Some(existing) = handles.get(url) {
                return existing.clone();
            }
            handles.insert(url.clone(), handle.clone());
        }

        let fetcher = Arc::clone(&self.inner.fetcher);
        let network_backed = self.inner.network_backed.load(Ordering::SeqCst);
        let url = url.clone();
        let resolving = handle.clone();
        tokio::spawn(async move {
            match fetcher.fetch(&url).await {
                Ok(FetchResult::Found(payloads)) => {
                    if let Err(err) = resolving.apply_initial(&payloads) {
                        log::warn!("failed to apply stored state for {}: {}", url, err);
                        resolving.set_state(HandleState::Unavailable);
                        return;
                    }
                    resolving.set_state(HandleState::Ready);
                }
                Ok(FetchResult::Unavailable) => {
                    if network_backed {
                        log::debug!("{} not in storage; waiting for relay delivery", url);
                    } else {
                        resolving.set_state(HandleState::Unavailable);
                    }
                }
                Ok(FetchResult::Pending) => {
                    log::debug!("fetch pending for {}; waiting for out-of-band delivery", url);
                }
                Err(err) => {
                    log::warn!("fetch failed for {}: {}", url, err);
                    resolving.set_state(HandleState::Unavailable);
                }
            }
        });

        handle
    }

    /// Get a handle from the cache without triggering resolution.
    pub fn get(&self, url: &DocUrl) -> Option<DocHandle> {
        self.inner.handles.lock().unwrap().get(url).cloned()
    }

    /// All handles currently cached in this session.
    pub fn handles(&self) -> Vec<DocHandle> {
        self.inner.handles.lock().unwrap().values().cloned().collect()
    }

    /// Remove a handle from the cache.
    pub fn remove(&self, url: &DocUrl) -> Option<DocHandle> {
        self.inner.handles.lock().unwrap().remove(url)
    }

    /// Apply an update pushed by a remote peer.
    ///
    /// Creates the handle if the document was not known yet; a `Loading`
    /// handle is resolved by the first delivered update.
    pub fn apply_remote(&self, url: &DocUrl, payload: &[u8]) -> Result<()> {
        let handle = {
            let mut handles = self.inner.handles.lock().unwrap();
            match handles.get(url) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = DocHandle::new(
                        url.clone(),
                        HandleState::Loading,
                        Arc::clone(&self.inner.storage),
                        self.inner.local_updates.clone(),
                    );
                    handles.insert(url.clone(), handle.clone());
                    handle
                }
            }
        };
        handle.apply_remote_update(payload, UpdateOrigin::Remote)
    }

    /// Subscribe to locally produced updates, for outbound replication.
    pub(crate) fn on_local_update(
        &self,
        callback: Callback<DocUpdated>,
    ) -> CallbackSubscription<DocUpdated> {
        self.inner.local_updates.subscribe(callback)
    }
}

impl std::fmt::Debug for DocRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handles = self.inner.handles.lock().unwrap();
        f.debug_struct("DocRepo")
            .field("handles", &handles.keys().collect::<Vec<_>>())
            .finish()
    }
}
