//! Resource state and per-category property schemas.
//!
//! Each category declares an ordered table of [`PropertyDef`]s. A property
//! bag is produced by walking the table against a state snapshot; references
//! to peers are turned into handles through a [`HandleResolver`] at that
//! point, so a bag never holds a dangling identity.

use serde::Serialize;

use crate::types::{Handle, HandleKind, Identity, ObjectRef, PropertyBag, PropertyValue};

/// Turns a peer reference into a handle, reserving one if the peer has not
/// been registered yet.
pub trait HandleResolver {
    fn resolve(&self, target: &ObjectRef) -> Handle;
}

/// Exposed type of a property, rendered as its wire signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyType {
    Bool,
    Byte,
    U32,
    U64,
    Str,
    StrList,
    Path,
    PathList,
    Status,
    Variant,
}

impl PropertyType {
    pub fn signature(self) -> &'static str {
        match self {
            PropertyType::Bool => "b",
            PropertyType::Byte => "y",
            PropertyType::U32 => "u",
            PropertyType::U64 => "t",
            PropertyType::Str => "s",
            PropertyType::StrList => "as",
            PropertyType::Path => "o",
            PropertyType::PathList => "ao",
            PropertyType::Status => "(is)",
            PropertyType::Variant => "v",
        }
    }
}

/// One row of a category schema.
pub struct PropertyDef<S: 'static> {
    pub name: &'static str,
    pub ty: PropertyType,
    pub get: fn(&S, &dyn HandleResolver) -> PropertyValue,
}

fn build<S: 'static>(
    defs: impl IntoIterator<Item = &'static PropertyDef<S>>,
    state: &S,
    resolver: &dyn HandleResolver,
) -> PropertyBag {
    defs.into_iter()
        .map(|def| (def.name, (def.get)(state, resolver)))
        .collect()
}

fn attr_is(attr: &str, index: usize, flag: char) -> bool {
    attr.chars().nth(index) == Some(flag)
}

fn path(target: &Option<ObjectRef>, resolver: &dyn HandleResolver) -> PropertyValue {
    PropertyValue::Path(target.as_ref().map(|t| resolver.resolve(t)))
}

fn paths(targets: &[ObjectRef], resolver: &dyn HandleResolver) -> PropertyValue {
    PropertyValue::PathList(targets.iter().map(|t| resolver.resolve(t)).collect())
}

// ---------------------------------------------------------------------------
// Physical volumes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PvState {
    pub name: String,
    pub uuid: String,
    pub fmt: String,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub dev_size_bytes: u64,
    pub mda_size_bytes: u64,
    pub mda_free_bytes: u64,
    pub ba_start: u64,
    pub ba_size_bytes: u64,
    pub pe_start: u64,
    pub pe_count: u64,
    pub pe_alloc_count: u64,
    pub attr: String,
    pub tags: Vec<String>,
    pub vg: Option<ObjectRef>,
    pub lvs: Vec<ObjectRef>,
}

pub static PV_SCHEMA: &[PropertyDef<PvState>] = &[
    PropertyDef { name: "Uuid", ty: PropertyType::Str, get: |s, _| s.uuid.as_str().into() },
    PropertyDef { name: "Name", ty: PropertyType::Str, get: |s, _| s.name.as_str().into() },
    PropertyDef { name: "Fmt", ty: PropertyType::Str, get: |s, _| s.fmt.as_str().into() },
    PropertyDef { name: "SizeBytes", ty: PropertyType::U64, get: |s, _| s.size_bytes.into() },
    PropertyDef { name: "FreeBytes", ty: PropertyType::U64, get: |s, _| s.free_bytes.into() },
    PropertyDef { name: "UsedBytes", ty: PropertyType::U64, get: |s, _| s.used_bytes.into() },
    PropertyDef { name: "DevSizeBytes", ty: PropertyType::U64, get: |s, _| s.dev_size_bytes.into() },
    PropertyDef { name: "MdaSizeBytes", ty: PropertyType::U64, get: |s, _| s.mda_size_bytes.into() },
    PropertyDef { name: "MdaFreeBytes", ty: PropertyType::U64, get: |s, _| s.mda_free_bytes.into() },
    PropertyDef { name: "BaStart", ty: PropertyType::U64, get: |s, _| s.ba_start.into() },
    PropertyDef { name: "BaSizeBytes", ty: PropertyType::U64, get: |s, _| s.ba_size_bytes.into() },
    PropertyDef { name: "PeStart", ty: PropertyType::U64, get: |s, _| s.pe_start.into() },
    PropertyDef { name: "PeCount", ty: PropertyType::U64, get: |s, _| s.pe_count.into() },
    PropertyDef { name: "PeAllocCount", ty: PropertyType::U64, get: |s, _| s.pe_alloc_count.into() },
    PropertyDef { name: "Tags", ty: PropertyType::StrList, get: |s, _| PropertyValue::StrList(s.tags.clone()) },
    PropertyDef { name: "Vg", ty: PropertyType::Path, get: |s, r| path(&s.vg, r) },
    PropertyDef { name: "Lv", ty: PropertyType::PathList, get: |s, r| paths(&s.lvs, r) },
    PropertyDef { name: "Allocatable", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 0, 'a').into() },
    PropertyDef { name: "Exportable", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 1, 'x').into() },
    PropertyDef { name: "Missing", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 2, 'm').into() },
];

// ---------------------------------------------------------------------------
// Volume groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VgState {
    pub name: String,
    pub uuid: String,
    pub fmt: String,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub sys_id: String,
    pub extent_size_bytes: u64,
    pub extent_count: u64,
    pub free_count: u64,
    pub profile: String,
    pub max_lv: u64,
    pub max_pv: u64,
    pub pv_count: u64,
    pub lv_count: u64,
    pub snap_count: u64,
    pub seqno: u64,
    pub mda_count: u64,
    pub mda_free: u64,
    pub mda_size_bytes: u64,
    pub mda_used_count: u64,
    pub attr: String,
    pub tags: Vec<String>,
    pub pvs: Vec<ObjectRef>,
    pub lvs: Vec<ObjectRef>,
}

pub static VG_SCHEMA: &[PropertyDef<VgState>] = &[
    PropertyDef { name: "Uuid", ty: PropertyType::Str, get: |s, _| s.uuid.as_str().into() },
    PropertyDef { name: "Name", ty: PropertyType::Str, get: |s, _| s.name.as_str().into() },
    PropertyDef { name: "Fmt", ty: PropertyType::Str, get: |s, _| s.fmt.as_str().into() },
    PropertyDef { name: "SizeBytes", ty: PropertyType::U64, get: |s, _| s.size_bytes.into() },
    PropertyDef { name: "FreeBytes", ty: PropertyType::U64, get: |s, _| s.free_bytes.into() },
    PropertyDef { name: "SysId", ty: PropertyType::Str, get: |s, _| s.sys_id.as_str().into() },
    PropertyDef { name: "ExtentSizeBytes", ty: PropertyType::U64, get: |s, _| s.extent_size_bytes.into() },
    PropertyDef { name: "ExtentCount", ty: PropertyType::U64, get: |s, _| s.extent_count.into() },
    PropertyDef { name: "FreeCount", ty: PropertyType::U64, get: |s, _| s.free_count.into() },
    PropertyDef { name: "Profile", ty: PropertyType::Str, get: |s, _| s.profile.as_str().into() },
    PropertyDef { name: "MaxLv", ty: PropertyType::U64, get: |s, _| s.max_lv.into() },
    PropertyDef { name: "MaxPv", ty: PropertyType::U64, get: |s, _| s.max_pv.into() },
    PropertyDef { name: "PvCount", ty: PropertyType::U64, get: |s, _| s.pv_count.into() },
    PropertyDef { name: "LvCount", ty: PropertyType::U64, get: |s, _| s.lv_count.into() },
    PropertyDef { name: "SnapCount", ty: PropertyType::U64, get: |s, _| s.snap_count.into() },
    PropertyDef { name: "Seqno", ty: PropertyType::U64, get: |s, _| s.seqno.into() },
    PropertyDef { name: "MdaCount", ty: PropertyType::U64, get: |s, _| s.mda_count.into() },
    PropertyDef { name: "MdaFree", ty: PropertyType::U64, get: |s, _| s.mda_free.into() },
    PropertyDef { name: "MdaSizeBytes", ty: PropertyType::U64, get: |s, _| s.mda_size_bytes.into() },
    PropertyDef { name: "MdaUsedCount", ty: PropertyType::U64, get: |s, _| s.mda_used_count.into() },
    PropertyDef { name: "Tags", ty: PropertyType::StrList, get: |s, _| PropertyValue::StrList(s.tags.clone()) },
    PropertyDef { name: "Pvs", ty: PropertyType::PathList, get: |s, r| paths(&s.pvs, r) },
    PropertyDef { name: "Lvs", ty: PropertyType::PathList, get: |s, r| paths(&s.lvs, r) },
    PropertyDef { name: "Writeable", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 0, 'w').into() },
    PropertyDef {
        name: "Readable",
        ty: PropertyType::Bool,
        get: |s, _| (attr_is(&s.attr, 0, 'w') || attr_is(&s.attr, 0, 'r')).into(),
    },
    PropertyDef { name: "Resizeable", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 1, 'z').into() },
    PropertyDef { name: "Exportable", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 2, 'x').into() },
    PropertyDef { name: "Partial", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 3, 'p').into() },
    PropertyDef { name: "Clustered", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 5, 'c').into() },
];

// ---------------------------------------------------------------------------
// Logical volumes
// ---------------------------------------------------------------------------

/// Sub-category of a logical volume. Decides both the handle category and
/// which schema rows apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LvKind {
    #[default]
    Plain,
    Snapshot,
    ThinPool,
    CachePool,
    Hidden,
}

impl LvKind {
    /// Classify from the short name, attribute string, layout and origin.
    pub fn classify(name: &str, attr: &str, layout: &str, has_origin: bool) -> Self {
        if name.starts_with('[') {
            return LvKind::Hidden;
        }
        match attr.chars().next() {
            Some('t') => LvKind::ThinPool,
            Some('C') if layout.contains("pool") => LvKind::CachePool,
            Some('s') | Some('S') => LvKind::Snapshot,
            _ if has_origin => LvKind::Snapshot,
            _ => LvKind::Plain,
        }
    }

    pub fn handle_kind(self) -> HandleKind {
        match self {
            LvKind::Plain | LvKind::Snapshot => HandleKind::Lv,
            LvKind::ThinPool => HandleKind::ThinPool,
            LvKind::CachePool => HandleKind::CachePool,
            LvKind::Hidden => HandleKind::HiddenLv,
        }
    }

    pub fn is_pool(self) -> bool {
        matches!(self, LvKind::ThinPool | LvKind::CachePool)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LvState {
    /// Short name within the volume group, brackets included for hidden volumes.
    pub name: String,
    pub uuid: String,
    pub path: String,
    pub size_bytes: u64,
    pub vg_name: String,
    pub vg_uuid: String,
    pub kind: LvKind,
    pub pool_lv: Option<ObjectRef>,
    pub origin_lv: Option<ObjectRef>,
    pub data_lv: Option<ObjectRef>,
    pub metadata_lv: Option<ObjectRef>,
    pub data_percent: u32,
    pub attr: String,
    pub layout: String,
    pub tags: Vec<String>,
    pub active: bool,
    pub segtypes: Vec<String>,
    pub devices: Vec<ObjectRef>,
}

impl LvState {
    /// `vg/lv`, the name the external tool addresses the volume by.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }

    pub fn vg_ref(&self) -> ObjectRef {
        ObjectRef::new(Identity::new(self.vg_uuid.as_str(), self.vg_name.as_str()), HandleKind::Vg)
    }
}

pub static LV_SCHEMA: &[PropertyDef<LvState>] = &[
    PropertyDef { name: "Uuid", ty: PropertyType::Str, get: |s, _| s.uuid.as_str().into() },
    PropertyDef { name: "Name", ty: PropertyType::Str, get: |s, _| s.name.as_str().into() },
    PropertyDef { name: "Path", ty: PropertyType::Str, get: |s, _| s.path.as_str().into() },
    PropertyDef { name: "SizeBytes", ty: PropertyType::U64, get: |s, _| s.size_bytes.into() },
    PropertyDef { name: "DataPercent", ty: PropertyType::U32, get: |s, _| PropertyValue::U32(s.data_percent) },
    PropertyDef { name: "SegType", ty: PropertyType::StrList, get: |s, _| PropertyValue::StrList(s.segtypes.clone()) },
    PropertyDef { name: "Vg", ty: PropertyType::Path, get: |s, r| PropertyValue::Path(Some(r.resolve(&s.vg_ref()))) },
    PropertyDef { name: "OriginLv", ty: PropertyType::Path, get: |s, r| path(&s.origin_lv, r) },
    PropertyDef { name: "PoolLv", ty: PropertyType::Path, get: |s, r| path(&s.pool_lv, r) },
    PropertyDef { name: "Devices", ty: PropertyType::PathList, get: |s, r| paths(&s.devices, r) },
    PropertyDef { name: "Tags", ty: PropertyType::StrList, get: |s, _| PropertyValue::StrList(s.tags.clone()) },
    PropertyDef { name: "Active", ty: PropertyType::Bool, get: |s, _| s.active.into() },
    PropertyDef { name: "IsThinVolume", ty: PropertyType::Bool, get: |s, _| attr_is(&s.attr, 0, 'V').into() },
    PropertyDef { name: "IsThinPool", ty: PropertyType::Bool, get: |s, _| (s.kind == LvKind::ThinPool).into() },
];

/// Extra rows carried by thin and cache pools.
pub static LV_POOL_SCHEMA: &[PropertyDef<LvState>] = &[
    PropertyDef { name: "DataLv", ty: PropertyType::Path, get: |s, r| path(&s.data_lv, r) },
    PropertyDef { name: "MetaDataLv", ty: PropertyType::Path, get: |s, r| path(&s.metadata_lv, r) },
];

fn lv_defs(kind: LvKind) -> Vec<&'static PropertyDef<LvState>> {
    let extra: &'static [PropertyDef<LvState>] = if kind.is_pool() { LV_POOL_SCHEMA } else { &[] };
    LV_SCHEMA.iter().chain(extra.iter()).collect()
}

// ---------------------------------------------------------------------------
// ResourceState
// ---------------------------------------------------------------------------

/// Snapshot of one external resource as last fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceState {
    Pv(PvState),
    Vg(VgState),
    Lv(LvState),
}

impl ResourceState {
    pub fn identity(&self) -> Identity {
        match self {
            ResourceState::Pv(pv) => Identity::new(pv.uuid.as_str(), pv.name.as_str()),
            ResourceState::Vg(vg) => Identity::new(vg.uuid.as_str(), vg.name.as_str()),
            ResourceState::Lv(lv) => Identity::new(lv.uuid.as_str(), lv.full_name()),
        }
    }

    pub fn handle_kind(&self) -> HandleKind {
        match self {
            ResourceState::Pv(_) => HandleKind::Pv,
            ResourceState::Vg(_) => HandleKind::Vg,
            ResourceState::Lv(lv) => lv.kind.handle_kind(),
        }
    }

    /// Build the property bag, resolving peer references to handles.
    pub fn properties(&self, resolver: &dyn HandleResolver) -> PropertyBag {
        match self {
            ResourceState::Pv(pv) => build(PV_SCHEMA, pv, resolver),
            ResourceState::Vg(vg) => build(VG_SCHEMA, vg, resolver),
            ResourceState::Lv(lv) => build(lv_defs(lv.kind), lv, resolver),
        }
    }

    /// `(name, type)` for every exposed property, in schema order.
    pub fn property_types(&self) -> Vec<(&'static str, PropertyType)> {
        match self {
            ResourceState::Pv(_) => PV_SCHEMA.iter().map(|d| (d.name, d.ty)).collect(),
            ResourceState::Vg(_) => VG_SCHEMA.iter().map(|d| (d.name, d.ty)).collect(),
            ResourceState::Lv(lv) => lv_defs(lv.kind).into_iter().map(|d| (d.name, d.ty)).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapResolver {
        seen: RefCell<HashMap<String, Handle>>,
    }

    impl HandleResolver for MapResolver {
        fn resolve(&self, target: &ObjectRef) -> Handle {
            let mut seen = self.seen.borrow_mut();
            let next = seen.len() as u64;
            *seen
                .entry(target.identity.name.clone())
                .or_insert_with(|| Handle::new(target.kind, next))
        }
    }

    fn thin_pool() -> LvState {
        LvState {
            name: "pool".into(),
            uuid: "lv-u-1".into(),
            vg_name: "vg0".into(),
            vg_uuid: "vg-u-1".into(),
            kind: LvKind::ThinPool,
            attr: "twi-a-tz--".into(),
            data_lv: Some(ObjectRef::new(Identity::named("vg0/[pool_tdata]"), HandleKind::HiddenLv)),
            metadata_lv: Some(ObjectRef::new(Identity::named("vg0/[pool_tmeta]"), HandleKind::HiddenLv)),
            ..LvState::default()
        }
    }

    #[test]
    fn classify_follows_name_then_attr() {
        assert_eq!(LvKind::classify("[pool_tdata]", "Twi-ao----", "", false), LvKind::Hidden);
        assert_eq!(LvKind::classify("pool", "twi-a-tz--", "thin,pool", false), LvKind::ThinPool);
        assert_eq!(LvKind::classify("cpool", "Cwi---C---", "cache,pool", false), LvKind::CachePool);
        assert_eq!(LvKind::classify("cached", "Cwi-a-C---", "cache", false), LvKind::Plain);
        assert_eq!(LvKind::classify("snap", "swi-a-s---", "", true), LvKind::Snapshot);
        assert_eq!(LvKind::classify("thin_snap", "Vwi---tz-k", "thin", true), LvKind::Snapshot);
        assert_eq!(LvKind::classify("lv", "-wi-a-----", "linear", false), LvKind::Plain);
    }

    #[test]
    fn pools_carry_data_and_metadata_rows() {
        let state = ResourceState::Lv(thin_pool());
        let names: Vec<_> = state.property_types().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"DataLv"));
        assert!(names.contains(&"MetaDataLv"));

        let plain = ResourceState::Lv(LvState { kind: LvKind::Plain, ..thin_pool() });
        assert!(!plain.property_types().iter().any(|(n, _)| *n == "DataLv"));
    }

    #[test]
    fn properties_resolve_references() {
        let resolver = MapResolver::default();
        let state = ResourceState::Lv(thin_pool());
        let bag = state.properties(&resolver);

        assert_eq!(bag["Name"], PropertyValue::Str("pool".into()));
        assert_eq!(bag["PoolLv"], PropertyValue::Path(None));
        assert!(matches!(bag["DataLv"], PropertyValue::Path(Some(h)) if h.kind() == HandleKind::HiddenLv));
        assert!(matches!(bag["Vg"], PropertyValue::Path(Some(h)) if h.kind() == HandleKind::Vg));
        assert_eq!(bag["IsThinPool"], PropertyValue::Bool(true));
        assert_eq!(state.identity().name, "vg0/pool");
        assert_eq!(state.handle_kind(), HandleKind::ThinPool);
    }

    #[test]
    fn attr_flags_map_to_booleans() {
        let pv = PvState { attr: "ax-".into(), ..PvState::default() };
        let bag = ResourceState::Pv(pv).properties(&MapResolver::default());
        assert_eq!(bag["Allocatable"], PropertyValue::Bool(true));
        assert_eq!(bag["Exportable"], PropertyValue::Bool(true));
        assert_eq!(bag["Missing"], PropertyValue::Bool(false));
    }

    #[test]
    fn signatures_match_wire_types() {
        assert_eq!(PropertyType::PathList.signature(), "ao");
        assert_eq!(PropertyType::Status.signature(), "(is)");
        assert_eq!(PropertyType::U64.signature(), "t");
    }
}
