//! Cancellation scopes.
//!
//! A [`Scope`] bounds the lifetime of asynchronous work for a space. In-flight
//! waits select against [`Scope::cancelled`] and fail with
//! [`LatticeError::Cancelled`](crate::error::LatticeError::Cancelled) once the
//! scope is disposed, and disposer callbacks registered with
//! [`Scope::on_dispose`] run exactly once at disposal (used to delete
//! ephemeral documents that were never promoted to durable state).

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

type Disposer = Box<dyn FnOnce() + Send>;

/// A cancellation scope shared by reference.
///
/// Cloning is cheap; all clones observe the same disposal.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    disposed: watch::Sender<bool>,
    disposers: Mutex<Vec<Disposer>>,
}

impl Scope {
    /// Create a new, undisposed scope.
    pub fn new() -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                disposed,
                disposers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the scope has been disposed.
    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    /// Register a callback to run when the scope is disposed.
    ///
    /// If the scope is already disposed, the callback runs immediately.
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut disposers = self.inner.disposers.lock().unwrap();
            if !self.is_disposed() {
                disposers.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Dispose the scope: wake all pending [`cancelled`](Scope::cancelled)
    /// waits and run registered disposers. Idempotent.
    pub fn dispose(&self) {
        let already = self.inner.disposed.send_replace(true);
        if already {
            return;
        }
        let disposers: Vec<Disposer> = {
            let mut disposers = self.inner.disposers.lock().unwrap();
            disposers.drain(..).collect()
        };
        for disposer in disposers {
            disposer();
        }
    }

    /// Resolve once the scope is disposed. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.disposed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
