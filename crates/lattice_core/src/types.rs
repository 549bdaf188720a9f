//! Core data model shared by the engine and space layers.
//!
//! This module defines the logical shape of a space document
//! (`objects`/`links`/`access`), the per-object structure stored inside it,
//! change patches as emitted by document handles, and the update log records
//! persisted by storage backends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key path into a document or object structure.
pub type KeyPath = Vec<String>;

/// Scheme prefix for document URLs.
const DOC_URL_SCHEME: &str = "doc:";

/// Stable identifier of an application object within a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Generate a fresh random object id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable URL addressing a CRDT document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocUrl(String);

impl DocUrl {
    /// Generate a fresh random document URL.
    pub fn random() -> Self {
        Self(format!(
            "{}{}",
            DOC_URL_SCHEME,
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Parse a string into a document URL, returning `None` if it is not a
    /// valid URL.
    pub fn parse(value: &str) -> Option<Self> {
        if Self::is_valid(value) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    /// Whether a string is a well-formed document URL.
    pub fn is_valid(value: &str) -> bool {
        value
            .strip_prefix(DOC_URL_SCHEME)
            .is_some_and(|rest| !rest.is_empty())
    }

    /// The URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key identifying the space that owns a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceKey(String);

impl SpaceKey {
    /// Generate a fresh random space key.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SpaceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SpaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an object's schema/type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRef(String);

impl TypeRef {
    /// Create a type reference from a type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The well-known type of the per-space properties object.
    ///
    /// Properties must stay inline in the root document so they are readable
    /// as soon as the space becomes available, regardless of the
    /// fragmentation setting.
    pub fn properties() -> Self {
        Self("space.properties".to_string())
    }

    /// The type name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provenance key linking an object to an external source record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Name of the external source.
    pub source: String,
    /// Identifier within that source.
    pub id: String,
}

/// Object metadata carried alongside the data payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Provenance keys.
    #[serde(default)]
    pub keys: Vec<ForeignKey>,
}

/// System-managed portion of an object structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSystem {
    /// Soft deletion tombstone. Objects are never physically removed from a
    /// document, only flagged.
    #[serde(default)]
    pub deleted: bool,

    /// Reference to the object's schema/type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_ref: Option<TypeRef>,
}

/// The full stored shape of one application object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStructure {
    /// User data fields.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,

    /// Object metadata.
    #[serde(default)]
    pub meta: ObjectMeta,

    /// System-managed state (tombstone, type).
    #[serde(default)]
    pub system: ObjectSystem,
}

impl ObjectStructure {
    /// Create a structure with the given data fields and type.
    pub fn new(data: BTreeMap<String, serde_json::Value>, type_ref: Option<TypeRef>) -> Self {
        Self {
            data,
            meta: ObjectMeta::default(),
            system: ObjectSystem {
                deleted: false,
                type_ref,
            },
        }
    }
}

/// Access record stamped once per document to identify the owning space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceAccess {
    /// The owning space's key.
    pub space_key: SpaceKey,
}

/// Decoded snapshot of a space document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceDoc {
    /// Objects stored inline in this document.
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, ObjectStructure>,

    /// Objects stored in separate linked documents.
    #[serde(default)]
    pub links: BTreeMap<ObjectId, DocUrl>,

    /// Owning-space stamp, absent until first stamped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<SpaceAccess>,
}

/// Root document location for a space, supplied by the space-management
/// layer when opening.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceState {
    /// URL of the space's root document, absent for local-only draft spaces.
    pub root_url: Option<DocUrl>,
}

/// One segment of a patch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Map key.
    Key(String),
    /// Array index.
    Index(u32),
}

impl PathSegment {
    /// The segment as a map key, if it is one.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Key(value.to_string())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

/// A single description of a document change, as emitted by a handle's
/// change event.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Path of the changed entry within the document.
    pub path: Vec<PathSegment>,
    /// New value at the path, `None` when the entry was removed.
    pub value: Option<serde_json::Value>,
}

/// Opaque version marker for a document or unattached object state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heads(Vec<u8>);

impl Heads {
    /// Wrap raw encoded version bytes.
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Version marker for an unattached object's local change counter.
    pub(crate) fn from_counter(version: u64) -> Self {
        Self(version.to_be_bytes().to_vec())
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Origin of a document update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from initial sync handshake
    Sync,
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// A document update record, stored for history and sync purposes.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    /// Unique identifier for this update
    pub id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Binary update data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was created (milliseconds)
    pub timestamp: i64,

    /// Origin of this update (local edit, remote sync, etc.)
    pub origin: UpdateOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(ObjectId::random(), ObjectId::random());
        assert_ne!(DocUrl::random(), DocUrl::random());
        assert_ne!(SpaceKey::random(), SpaceKey::random());
    }

    #[test]
    fn test_doc_url_parse() {
        let url = DocUrl::random();
        assert_eq!(DocUrl::parse(url.as_str()), Some(url));

        assert!(DocUrl::parse("doc:").is_none());
        assert!(DocUrl::parse("not-a-url").is_none());
        assert!(DocUrl::parse("").is_none());
    }

    #[test]
    fn test_object_structure_serde() {
        let mut data = BTreeMap::new();
        data.insert("title".to_string(), serde_json::json!("hello"));
        let structure = ObjectStructure::new(data, Some(TypeRef::new("note")));

        let json = serde_json::to_string(&structure).unwrap();
        let decoded: ObjectStructure = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, structure);
        assert!(!decoded.system.deleted);
        assert_eq!(decoded.system.type_ref.unwrap().as_str(), "note");
    }

    #[test]
    fn test_object_structure_defaults_on_missing_fields() {
        let decoded: ObjectStructure = serde_json::from_str("{}").unwrap();
        assert!(decoded.data.is_empty());
        assert!(!decoded.system.deleted);
        assert!(decoded.system.type_ref.is_none());
    }

    #[test]
    fn test_space_doc_defaults() {
        let decoded: SpaceDoc = serde_json::from_str("{}").unwrap();
        assert!(decoded.objects.is_empty());
        assert!(decoded.links.is_empty());
        assert!(decoded.access.is_none());
    }

    #[test]
    fn test_path_segment_as_key() {
        assert_eq!(PathSegment::from("objects").as_key(), Some("objects"));
        assert_eq!(PathSegment::Index(3).as_key(), None);
    }

    #[test]
    fn test_update_origin_roundtrip() {
        assert_eq!(UpdateOrigin::Local.to_string(), "local");
        assert_eq!(
            "remote".parse::<UpdateOrigin>().unwrap(),
            UpdateOrigin::Remote
        );
        assert!("invalid".parse::<UpdateOrigin>().is_err());
    }
}
