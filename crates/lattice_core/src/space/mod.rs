//! Space layer: document loader, object binding cores, and the object
//! registry.

mod db;
mod doc_loader;
mod object_core;

pub use db::{ItemsUpdated, SpaceDb};
pub use doc_loader::{DocumentChanges, DocumentLoader, ObjectDocumentLoaded, RootDocLoad};
pub use object_core::{BindOptions, DocAccessor, ObjectCore, UpdateSubscription};
