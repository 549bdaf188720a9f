//! Per-object binding core.
//!
//! An [`ObjectCore`] gives every application object one accessor abstraction
//! that hides whether the object is backed by a private in-memory snapshot
//! or by an attached document handle plus mount path. The backing is a
//! tagged enum, so exactly one representation exists at any time; the
//! unattached-to-attached transition happens once at bind time, and
//! rebinding only ever swaps the target handle.
//!
//! All accessor paths are computed as `mount_path ++ ["data"] ++ path`, so
//! the accessor is agnostic to whether the mount path is empty (unattached)
//! or points into a document's `objects` map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::engine::{ChangeEvent, DocHandle};
use crate::error::Result;
use crate::event::{CallbackRegistry, CallbackSubscription};
use crate::types::{
    Heads, KeyPath, ObjectId, ObjectMeta, ObjectStructure, TypeRef,
};

/// Options for attaching an object core to a document.
pub struct BindOptions {
    /// The document to attach to. Must be ready.
    pub handle: DocHandle,
    /// Key path of the object structure within the document
    /// (`["objects", <id>]`).
    pub path: KeyPath,
    /// Write the local unattached state into the document at bind time.
    /// Requires the object to be unattached.
    pub assign_from_local_state: bool,
}

enum Backing {
    /// Private in-memory snapshot; the object is not attached to any space.
    Unattached {
        snapshot: ObjectStructure,
        version: u64,
    },
    /// Reference into a loaded document.
    Attached {
        handle: DocHandle,
        mount_path: KeyPath,
    },
}

/// Binding core: exactly one per live application object.
pub struct ObjectCore {
    id: ObjectId,
    backing: Mutex<Option<Backing>>,
    /// Manual update notifications: local changes while unattached, bind
    /// transitions, and registry-driven refreshes.
    updates: CallbackRegistry<()>,
}

impl ObjectCore {
    /// Create a core with a fresh random id. The core is torn down (no
    /// backing) until [`init_new_object`](ObjectCore::init_new_object) or
    /// [`bind`](ObjectCore::bind) is called.
    pub fn new() -> Self {
        Self::with_id(ObjectId::random())
    }

    /// Create a core for a known object id.
    pub fn with_id(id: ObjectId) -> Self {
        Self {
            id,
            backing: Mutex::new(None),
            updates: CallbackRegistry::new(),
        }
    }

    /// The object's id.
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Initialize the private in-memory state of a freshly constructed
    /// object.
    ///
    /// # Panics
    ///
    /// Panics if the object already has a backing; initializing twice is a
    /// caller bug.
    pub fn init_new_object(
        &self,
        data: BTreeMap<String, serde_json::Value>,
        type_ref: Option<TypeRef>,
    ) {
        let mut backing = self.backing.lock().unwrap();
        assert!(
            backing.is_none(),
            "object {} is already initialized",
            self.id
        );
        *backing = Some(Backing::Unattached {
            snapshot: ObjectStructure::new(data, type_ref),
            version: 0,
        });
    }

    /// Whether the object has any backing at all.
    pub fn is_initialized(&self) -> bool {
        self.backing.lock().unwrap().is_some()
    }

    /// Whether the object is attached to a document.
    pub fn is_attached(&self) -> bool {
        matches!(
            &*self.backing.lock().unwrap(),
            Some(Backing::Attached { .. })
        )
    }

    /// The attached document handle, if any.
    pub fn doc_handle(&self) -> Option<DocHandle> {
        match &*self.backing.lock().unwrap() {
            Some(Backing::Attached { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    /// The mount path within the attached document; empty while unattached.
    pub fn mount_path(&self) -> KeyPath {
        match &*self.backing.lock().unwrap() {
            Some(Backing::Attached { mount_path, .. }) => mount_path.clone(),
            _ => KeyPath::new(),
        }
    }

    /// Attach the object to a document, or move it to another one.
    ///
    /// With `assign_from_local_state` the unattached snapshot is written
    /// into the document at the mount path; otherwise the document is
    /// assumed to already hold the object's state (discovery and rebinding).
    ///
    /// # Panics
    ///
    /// Panics if the handle is not ready, or if `assign_from_local_state`
    /// is requested for an object that has no unattached snapshot.
    pub fn bind(&self, options: BindOptions) -> Result<()> {
        assert!(
            options.handle.is_ready(),
            "cannot bind object {} to a document that is not ready",
            self.id
        );
        let previous = self.backing.lock().unwrap().take();

        if options.assign_from_local_state {
            let snapshot = match previous {
                Some(Backing::Unattached { snapshot, .. }) => snapshot,
                _ => panic!(
                    "assign_from_local_state requires an unattached object ({})",
                    self.id
                ),
            };
            let object_id = mount_object_id(&options.path);
            if let Err(err) = options
                .handle
                .change(|doc| doc.set_object(&object_id, &snapshot))
            {
                // Restore the local state so the object is not torn down.
                *self.backing.lock().unwrap() = Some(Backing::Unattached {
                    snapshot,
                    version: 0,
                });
                return Err(err);
            }
        }

        *self.backing.lock().unwrap() = Some(Backing::Attached {
            handle: options.handle,
            mount_path: options.path,
        });
        self.notify_update();
        Ok(())
    }

    /// Current snapshot as a JSON value: the object structure while
    /// unattached, the whole document while attached. Paths into the
    /// snapshot are relative to [`mount_path`](ObjectCore::mount_path).
    ///
    /// # Panics
    ///
    /// Panics if the binding is torn down (no backing) — a registry
    /// lifecycle bug, not a recoverable error.
    pub fn doc(&self) -> serde_json::Value {
        match &*self.backing.lock().unwrap() {
            Some(Backing::Unattached { snapshot, .. }) => {
                serde_json::to_value(snapshot).unwrap_or_default()
            }
            Some(Backing::Attached { handle, .. }) => {
                let doc = handle
                    .doc_sync()
                    .expect("attached document is not ready");
                serde_json::to_value(&doc).unwrap_or_default()
            }
            None => panic!("object binding {} used after teardown", self.id),
        }
    }

    /// The object's structure, `None` if the attached document has no entry
    /// for it (not yet replicated).
    ///
    /// # Panics
    ///
    /// Panics if the binding is torn down.
    pub fn structure(&self) -> Option<ObjectStructure> {
        match &*self.backing.lock().unwrap() {
            Some(Backing::Unattached { snapshot, .. }) => Some(snapshot.clone()),
            Some(Backing::Attached { handle, mount_path }) => {
                let object_id = mount_object_id(mount_path);
                handle
                    .doc_sync()
                    .expect("attached document is not ready")
                    .objects
                    .get(&object_id)
                    .cloned()
            }
            None => panic!("object binding {} used after teardown", self.id),
        }
    }

    /// Apply a mutation to the object's structure.
    ///
    /// Unattached: the mutation is applied locally and a manual update
    /// notification is emitted, since no document-level change event will
    /// fire. Attached: the mutation is routed through the handle, whose own
    /// change event covers notification (no double emit).
    pub fn change<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ObjectStructure),
    {
        let mut mutator = Some(f);
        let attached = {
            let mut backing = self.backing.lock().unwrap();
            match backing.as_mut() {
                Some(Backing::Unattached { snapshot, version }) => {
                    (mutator.take().expect("mutator consumed once"))(snapshot);
                    *version += 1;
                    None
                }
                Some(Backing::Attached { handle, mount_path }) => {
                    Some((handle.clone(), mount_object_id(mount_path)))
                }
                None => panic!("object binding {} used after teardown", self.id),
            }
        };
        match attached {
            None => {
                self.notify_update();
                Ok(())
            }
            Some((handle, object_id)) => {
                let f = mutator.take().expect("mutator unused on the attached route");
                handle.change(|doc| {
                    let mut structure = doc.object(&object_id).unwrap_or_default();
                    f(&mut structure);
                    doc.set_object(&object_id, &structure);
                })
            }
        }
    }

    /// Apply a mutation against a specific version of the object.
    ///
    /// Returns the resulting version markers, or `None` if the mutation
    /// produced no new state.
    pub fn change_at<F>(&self, heads: &Heads, f: F) -> Result<Option<Heads>>
    where
        F: FnOnce(&mut ObjectStructure),
    {
        enum Route {
            Local(Option<Heads>),
            Doc(DocHandle, ObjectId),
        }

        let mut mutator = Some(f);
        let route = {
            let mut backing = self.backing.lock().unwrap();
            match backing.as_mut() {
                Some(Backing::Unattached { snapshot, version }) => {
                    let mut updated = snapshot.clone();
                    (mutator.take().expect("mutator consumed once"))(&mut updated);
                    if updated == *snapshot {
                        Route::Local(None)
                    } else {
                        *snapshot = updated;
                        *version += 1;
                        Route::Local(Some(Heads::from_counter(*version)))
                    }
                }
                Some(Backing::Attached { handle, mount_path }) => {
                    Route::Doc(handle.clone(), mount_object_id(mount_path))
                }
                None => panic!("object binding {} used after teardown", self.id),
            }
        };

        match route {
            Route::Local(None) => Ok(None),
            Route::Local(result) => {
                self.notify_update();
                Ok(result)
            }
            Route::Doc(handle, object_id) => {
                let f = mutator.take().expect("mutator unused on the attached route");
                let current = handle
                    .doc_sync()
                    .ok_or(crate::error::LatticeError::NotReady)?
                    .objects
                    .get(&object_id)
                    .cloned()
                    .unwrap_or_default();
                let mut updated = current.clone();
                f(&mut updated);
                if updated == current {
                    return Ok(None);
                }
                handle.change_at(heads, |doc| doc.set_object(&object_id, &updated))
            }
        }
    }

    /// Current version markers.
    pub fn heads(&self) -> Heads {
        match &*self.backing.lock().unwrap() {
            Some(Backing::Unattached { version, .. }) => Heads::from_counter(*version),
            Some(Backing::Attached { handle, .. }) => handle.heads(),
            None => panic!("object binding {} used after teardown", self.id),
        }
    }

    /// Read the value at a path relative to the object structure root
    /// (e.g. `["data", "title"]` or `["system", "deleted"]`).
    pub fn get(&self, path: &[&str]) -> Option<serde_json::Value> {
        let structure = self.structure()?;
        let value = serde_json::to_value(&structure).ok()?;
        get_deep(&value, path).cloned()
    }

    /// Write the value at a path relative to the object structure root.
    pub fn set(&self, path: &[&str], new_value: serde_json::Value) -> Result<()> {
        let id = self.id.clone();
        self.change(|structure| {
            let mut value = serde_json::to_value(&*structure).unwrap_or_default();
            set_deep(&mut value, path, new_value);
            match serde_json::from_value(value) {
                Ok(updated) => *structure = updated,
                Err(err) => log::warn!("rejecting malformed write to object {}: {}", id, err),
            }
        })
    }

    /// Delete the entry at a path relative to the object structure root.
    pub fn delete_at(&self, path: &[&str]) -> Result<()> {
        let id = self.id.clone();
        self.change(|structure| {
            let mut value = serde_json::to_value(&*structure).unwrap_or_default();
            remove_deep(&mut value, path);
            match serde_json::from_value(value) {
                Ok(updated) => *structure = updated,
                Err(err) => log::warn!("rejecting malformed delete on object {}: {}", id, err),
            }
        })
    }

    /// Whether the object is tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.structure()
            .map(|structure| structure.system.deleted)
            .unwrap_or(false)
    }

    /// Set or clear the tombstone flag. The object's entry stays in the
    /// document either way.
    pub fn set_deleted(&self, deleted: bool) -> Result<()> {
        self.change(|structure| structure.system.deleted = deleted)
    }

    /// The object's type reference.
    pub fn type_ref(&self) -> Option<TypeRef> {
        self.structure()
            .and_then(|structure| structure.system.type_ref)
    }

    /// Set the object's type reference.
    pub fn set_type_ref(&self, type_ref: TypeRef) -> Result<()> {
        self.change(|structure| structure.system.type_ref = Some(type_ref))
    }

    /// The object's metadata.
    pub fn meta(&self) -> Option<ObjectMeta> {
        self.structure().map(|structure| structure.meta)
    }

    /// Replace the object's metadata.
    pub fn set_meta(&self, meta: ObjectMeta) -> Result<()> {
        self.change(|structure| structure.meta = meta)
    }

    /// Subscribe to update notifications.
    ///
    /// Attached objects forward the handle's native change events alongside
    /// the manual update source, so subscribers see document-originated and
    /// locally-applied-while-unattached changes through one interface.
    pub fn subscribe(&self, callback: Arc<dyn Fn() + Send + Sync>) -> UpdateSubscription {
        let manual_callback = Arc::clone(&callback);
        let manual = self
            .updates
            .subscribe(Arc::new(move |_: &()| manual_callback()));
        let handle_sub = match &*self.backing.lock().unwrap() {
            Some(Backing::Attached { handle, .. }) => {
                Some(handle.on_change(Arc::new(move |_: &ChangeEvent| callback())))
            }
            _ => None,
        };
        UpdateSubscription {
            _manual: manual,
            _handle: handle_sub,
        }
    }

    /// Build an accessor rooted at a path within the object's data.
    pub fn doc_accessor(self: &Arc<Self>, path: KeyPath) -> DocAccessor {
        DocAccessor {
            core: Arc::clone(self),
            path,
        }
    }

    /// Fire an update notification. Called after local changes and by the
    /// registry after document-originated changes.
    pub fn notify_update(&self) {
        self.updates.emit(&());
    }
}

impl Default for ObjectCore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCore")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Subscription covering both the manual update source and, when attached,
/// the handle's native change event.
pub struct UpdateSubscription {
    _manual: CallbackSubscription<()>,
    _handle: Option<CallbackSubscription<ChangeEvent>>,
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription").finish()
    }
}

/// Accessor rooted at `mount_path ++ ["data"] ++ path`.
pub struct DocAccessor {
    core: Arc<ObjectCore>,
    path: KeyPath,
}

impl DocAccessor {
    /// The underlying object core.
    pub fn core(&self) -> &Arc<ObjectCore> {
        &self.core
    }

    /// Full path of this accessor within the object's document.
    pub fn full_path(&self) -> KeyPath {
        let mut full = self.core.mount_path();
        full.push("data".to_string());
        full.extend(self.path.iter().cloned());
        full
    }

    /// Read the value under this accessor.
    pub fn get(&self) -> Option<serde_json::Value> {
        let mut path: Vec<&str> = vec!["data"];
        path.extend(self.path.iter().map(String::as_str));
        self.core.get(&path)
    }

    /// Write the value under this accessor.
    pub fn set(&self, value: serde_json::Value) -> Result<()> {
        let mut path: Vec<&str> = vec!["data"];
        path.extend(self.path.iter().map(String::as_str));
        self.core.set(&path, value)
    }

    /// Subscribe to updates of the underlying object.
    pub fn subscribe(&self, callback: Arc<dyn Fn() + Send + Sync>) -> UpdateSubscription {
        self.core.subscribe(callback)
    }
}

/// Extract the object id from a `["objects", <id>]` mount path.
fn mount_object_id(path: &KeyPath) -> ObjectId {
    debug_assert!(path.len() == 2 && path[0] == "objects", "unexpected mount path {:?}", path);
    ObjectId::from(path.get(1).map(String::as_str).unwrap_or_default())
}

fn get_deep<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            serde_json::Value::Object(map) => map.get(*segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_deep(value: &mut serde_json::Value, path: &[&str], new_value: serde_json::Value) {
    let Some((last, parents)) = path.split_last() else {
        *value = new_value;
        return;
    };
    let mut current = value;
    for segment in parents {
        if !current.is_object() {
            *current = serde_json::Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert(serde_json::Value::Null);
    }
    if !current.is_object() {
        *current = serde_json::Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .unwrap()
        .insert(last.to_string(), new_value);
}

fn remove_deep(value: &mut serde_json::Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(*last);
    }
}
