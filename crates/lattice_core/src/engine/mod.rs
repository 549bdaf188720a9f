//! Engine session layer.
//!
//! Wraps the `yrs` CRDT engine into URL-addressable document handles with a
//! `loading -> ready | unavailable` lifecycle, a per-space repo that resolves
//! handles from storage or an async fetch source, and a document context that
//! optionally bridges the session to a remote peer over a relay transport.
//!
//! CRDT merge semantics are delegated entirely to `yrs`; this layer only
//! adds addressing, lifecycle, change notification, and persistence.

mod context;
mod handle;
mod memory;
mod repo;
mod storage;

pub use context::{BridgeEvent, DocumentContext, RelayMessage, RelayTransport};
pub use handle::{ChangeEvent, DocHandle, DocUpdated, HandleState, SpaceTxn};
pub use memory::MemoryStorage;
pub use repo::{DocFetcher, DocRepo, FetchResult, StorageFetcher};
pub use storage::{DocStorage, StorageResult};

use std::future::Future;
use std::pin::Pin;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
