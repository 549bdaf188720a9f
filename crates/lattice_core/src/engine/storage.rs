//! Storage abstraction for document persistence.
//!
//! This module defines the [`DocStorage`] trait which abstracts over storage
//! backends for persisting document snapshots and incremental updates.

use crate::error::LatticeError;
use crate::types::{UpdateOrigin, UpdateRecord};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, LatticeError>;

/// Trait for document storage backends.
///
/// # Storage Model
///
/// The storage maintains two types of data per document, keyed by the
/// document URL:
/// 1. **Snapshots**: compacted full state of a document
/// 2. **Update log**: incremental updates with their origins
///
/// The update log enables reconstructing a document that has never been
/// snapshotted, and lets replication layers replay what happened since a
/// known point.
pub trait DocStorage: Send + Sync {
    /// Load the full document snapshot as a binary blob.
    ///
    /// Returns `None` if no snapshot exists for the document.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document snapshot, overwriting any existing one.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document snapshot and all its updates.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> StorageResult<Vec<String>>;

    /// Append an incremental update to the update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin)
    -> StorageResult<i64>;

    /// Get all updates for a document, in append order.
    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<UpdateRecord>>;

    /// Get the latest update ID for a document.
    ///
    /// Returns 0 if no updates exist.
    fn get_latest_update_id(&self, name: &str) -> StorageResult<i64>;
}
