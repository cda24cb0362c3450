//! Domain types shared by every lvmd crate.
//!
//! A [`Handle`] is the stable external reference of a registered object; an
//! [`Identity`] is what the external tool knows the same resource by. Handles
//! render as object paths so that clients can treat them as opaque strings.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RegistryError;

/// Root of every handle path.
pub const BASE_PATH: &str = "/com/redhat/lvmdbus1";

/// Rendering of "no handle".
pub const EMPTY_PATH: &str = "/";

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Category of a handle. Each category owns an independent counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandleKind {
    Pv,
    Vg,
    Lv,
    ThinPool,
    CachePool,
    HiddenLv,
    Job,
}

impl HandleKind {
    pub const ALL: [HandleKind; 7] = [
        HandleKind::Pv,
        HandleKind::Vg,
        HandleKind::Lv,
        HandleKind::ThinPool,
        HandleKind::CachePool,
        HandleKind::HiddenLv,
        HandleKind::Job,
    ];

    /// Path segment used when rendering a handle of this kind.
    pub fn segment(self) -> &'static str {
        match self {
            HandleKind::Pv => "Pv",
            HandleKind::Vg => "Vg",
            HandleKind::Lv => "Lv",
            HandleKind::ThinPool => "ThinPool",
            HandleKind::CachePool => "CachePool",
            HandleKind::HiddenLv => "HiddenLv",
            HandleKind::Job => "Job",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.segment() == segment)
    }

    /// True for the logical-volume family of categories.
    pub fn is_lv(self) -> bool {
        matches!(
            self,
            HandleKind::Lv | HandleKind::ThinPool | HandleKind::CachePool | HandleKind::HiddenLv
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Opaque, never-reused reference to a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    kind: HandleKind,
    id: u64,
}

impl Handle {
    pub fn new(kind: HandleKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BASE_PATH}/{}/{}", self.kind.segment(), self.id)
    }
}

impl FromStr for Handle {
    type Err = RegistryError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidHandle {
            path: path.to_string(),
        };
        let rest = path
            .strip_prefix(BASE_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(invalid)?;
        let (segment, id) = rest.split_once('/').ok_or_else(invalid)?;
        let kind = HandleKind::from_segment(segment).ok_or_else(invalid)?;
        let id = id.parse::<u64>().map_err(|_| invalid())?;
        Ok(Handle::new(kind, id))
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        path.parse().map_err(serde::de::Error::custom)
    }
}

/// Render an optional handle, using `/` for none.
pub fn path_or_empty(handle: Option<Handle>) -> String {
    handle.map_or_else(|| EMPTY_PATH.to_string(), |h| h.to_string())
}

/// Per-category monotonic handle counters.
#[derive(Debug, Default)]
pub struct HandleFactory {
    counters: [AtomicU64; 7],
}

impl HandleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, kind: HandleKind) -> Handle {
        let id = self.counters[kind.index()].fetch_add(1, Ordering::Relaxed);
        Handle::new(kind, id)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// How the external tool names a resource: an optional stable UUID plus a
/// mutable user-facing name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
}

impl Identity {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            uuid: (!uuid.is_empty()).then_some(uuid),
            name: name.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            uuid: None,
            name: name.into(),
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Two identities denote the same resource if either the UUID or the name
    /// matches.
    pub fn matches(&self, other: &Identity) -> bool {
        let uuid_match = matches!((&self.uuid, &other.uuid), (Some(a), Some(b)) if a == b);
        uuid_match || self.name == other.name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uuid {
            Some(uuid) => write!(f, "{} ({uuid})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A reference from one resource to a peer, carrying the peer's category so
/// that a not-yet-registered peer can be reserved under the right counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectRef {
    pub identity: Identity,
    pub kind: HandleKind,
}

impl ObjectRef {
    pub fn new(identity: Identity, kind: HandleKind) -> Self {
        Self { identity, kind }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Value produced by a completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpValue {
    Handle(Handle),
    Count(u64),
    Unit,
}

impl fmt::Display for OpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpValue::Handle(handle) => handle.fmt(f),
            OpValue::Count(count) => count.fmt(f),
            OpValue::Unit => f.write_str(EMPTY_PATH),
        }
    }
}

/// One exposed property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Byte(u8),
    U32(u32),
    U64(u64),
    Str(String),
    StrList(Vec<String>),
    Path(#[serde(serialize_with = "serialize_path")] Option<Handle>),
    PathList(Vec<Handle>),
    Status(i32, String),
}

fn serialize_path<S: Serializer>(handle: &Option<Handle>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&path_or_empty(*handle))
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_owned())
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::U64(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

/// Properties in schema order.
pub type PropertyBag = IndexMap<&'static str, PropertyValue>;

/// Fields of `new` whose value differs from (or is absent in) `old`.
pub fn diff_properties(old: &PropertyBag, new: &PropertyBag) -> PropertyBag {
    new.iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, value)| (*name, value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_renders_as_object_path() {
        let handle = Handle::new(HandleKind::ThinPool, 4);
        assert_eq!(handle.to_string(), "/com/redhat/lvmdbus1/ThinPool/4");
        assert_eq!(handle.to_string().parse::<Handle>().unwrap(), handle);
    }

    #[test]
    fn handle_parse_rejects_foreign_paths() {
        assert!("/".parse::<Handle>().is_err());
        assert!("/com/redhat/lvmdbus1/Nope/1".parse::<Handle>().is_err());
        assert!("/com/redhat/lvmdbus1/Pv/x".parse::<Handle>().is_err());
    }

    #[test]
    fn factory_counters_are_per_category() {
        let factory = HandleFactory::new();
        assert_eq!(factory.next(HandleKind::Pv).id(), 0);
        assert_eq!(factory.next(HandleKind::Pv).id(), 1);
        assert_eq!(factory.next(HandleKind::Vg).id(), 0);
        assert_eq!(factory.next(HandleKind::Job).id(), 0);
    }

    #[test]
    fn identity_matches_on_either_key() {
        let a = Identity::new("u-1", "vg0");
        assert!(a.matches(&Identity::new("u-1", "renamed")));
        assert!(a.matches(&Identity::named("vg0")));
        assert!(!a.matches(&Identity::new("u-2", "vg1")));
        assert_eq!(Identity::new("", "x").uuid, None);
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let mut old = PropertyBag::new();
        old.insert("Name", "vg0".into());
        old.insert("FreeBytes", 10u64.into());
        let mut new = old.clone();
        new.insert("FreeBytes", 4u64.into());

        let changed = diff_properties(&old, &new);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed["FreeBytes"], PropertyValue::U64(4));
        assert!(diff_properties(&new, &new).is_empty());
    }

    #[test]
    fn values_serialize_plainly() {
        let json = serde_json::to_value(PropertyValue::Path(None)).unwrap();
        assert_eq!(json, serde_json::json!("/"));
        let json = serde_json::to_value(PropertyValue::Status(-1, "x".into())).unwrap();
        assert_eq!(json, serde_json::json!([-1, "x"]));
        let json = serde_json::to_value(OpValue::Unit).unwrap();
        assert_eq!(json, serde_json::Value::Null);
    }
}
