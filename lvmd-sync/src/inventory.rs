//! Inventory queries: lvm reports turned into resource states.

use std::collections::{BTreeMap, HashMap};

use lvmd_core::{HandleKind, Identity, LvKind, LvState, ObjectRef, PvState, ResourceState, VgState};

use crate::commands::{self, LV_COLUMNS, MOVE_COLUMNS, PV_COLUMNS, VG_COLUMNS};
use crate::error::SyncError;
use crate::exec::CommandRunner;
use crate::tabular::parse_column_names;

type Row = HashMap<String, String>;

/// Full snapshot of the external state, sorted by name within each family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub pvs: Vec<PvState>,
    pub vgs: Vec<VgState>,
    pub lvs: Vec<LvState>,
}

impl Inventory {
    pub fn len(&self) -> usize {
        self.pvs.len() + self.vgs.len() + self.lvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// PVs, then VGs, then LVs.
    pub fn into_states(self) -> impl Iterator<Item = ResourceState> {
        self.pvs
            .into_iter()
            .map(ResourceState::Pv)
            .chain(self.vgs.into_iter().map(ResourceState::Vg))
            .chain(self.lvs.into_iter().map(ResourceState::Lv))
    }

    pub fn vg(&self, name: &str) -> Option<&VgState> {
        self.vgs.iter().find(|vg| vg.name == name)
    }
}

/// One in-progress relocation as reported by lvm.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveStatus {
    pub key: String,
    pub src_dev: String,
    pub dest_dev: String,
    pub percent: f64,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Query PVs, VGs and LVs. Each query is retried per the runner's policy.
pub fn fetch(runner: &CommandRunner) -> Result<Inventory, SyncError> {
    let pvs = rows("pvs", &runner.query(&commands::pvs())?, PV_COLUMNS)?;
    let vgs = rows("vgs", &runner.query(&commands::vgs())?, VG_COLUMNS)?;
    let lvs = rows("lvs", &runner.query(&commands::lvs())?, LV_COLUMNS)?;
    build(&pvs, &vgs, &lvs)
}

/// Current relocations keyed by the internal move volume's full name.
pub fn fetch_moves(runner: &CommandRunner) -> Result<BTreeMap<String, MoveStatus>, SyncError> {
    let out = runner.query(&commands::move_status())?;
    parse_moves(&out)
}

pub fn parse_moves(out: &str) -> Result<BTreeMap<String, MoveStatus>, SyncError> {
    let mut moves = BTreeMap::new();
    for row in rows("lvs", out, MOVE_COLUMNS)? {
        let src_dev = field(&row, "move_pv").to_string();
        if src_dev.is_empty() {
            continue;
        }
        let key = field(&row, "lv_full_name").to_string();
        let percent = float(&row, "copy_percent", "lvs")?;
        let dest_dev = device_names(field(&row, "devices"))
            .into_iter()
            .find(|dev| *dev != src_dev)
            .unwrap_or_default();
        moves.entry(key.clone()).or_insert(MoveStatus {
            key,
            src_dev,
            dest_dev,
            percent,
        });
    }
    Ok(moves)
}

fn rows(command: &str, out: &str, columns: &[&str]) -> Result<Vec<Row>, SyncError> {
    let rows = parse_column_names(out, columns);
    if let Some(short) = rows.iter().find(|row| row.len() != columns.len()) {
        return Err(SyncError::Malformed {
            command: command.to_string(),
            detail: format!("expected {} columns, got {}", columns.len(), short.len()),
        });
    }
    Ok(rows)
}

fn field<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).map(String::as_str).unwrap_or("")
}

fn num(row: &Row, column: &str, command: &str) -> Result<u64, SyncError> {
    let raw = field(row, column);
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse().map_err(|_| SyncError::Malformed {
        command: command.to_string(),
        detail: format!("{column}={raw:?} is not a number"),
    })
}

fn float(row: &Row, column: &str, command: &str) -> Result<f64, SyncError> {
    let raw = field(row, column);
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse().map_err(|_| SyncError::Malformed {
        command: command.to_string(),
        detail: format!("{column}={raw:?} is not a number"),
    })
}

fn tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// `/dev/sda(0),/dev/sdb(128)` → device names, dropping extent offsets.
fn device_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|d| d.split('(').next().unwrap_or("").trim())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Building states
// ---------------------------------------------------------------------------

struct LvDraft {
    state: LvState,
    pool: String,
    pool_uuid: String,
    origin: String,
    origin_uuid: String,
    data_lv: String,
    metadata_lv: String,
    device_names: Vec<String>,
}

/// Assemble states from parsed rows, resolving every peer reference to an
/// identity plus category.
pub fn build(pv_rows: &[Row], vg_rows: &[Row], lv_rows: &[Row]) -> Result<Inventory, SyncError> {
    let pv_uuids: HashMap<&str, &str> = pv_rows
        .iter()
        .map(|r| (field(r, "pv_name"), field(r, "pv_uuid")))
        .collect();

    // Merge segment rows per volume.
    let mut drafts: Vec<LvDraft> = Vec::new();
    let mut by_uuid: HashMap<String, usize> = HashMap::new();
    for row in lv_rows {
        let uuid = field(row, "lv_uuid");
        let segtype = field(row, "segtype").to_string();
        let devices = device_names(field(row, "devices"));
        if let Some(&index) = by_uuid.get(uuid) {
            let draft = &mut drafts[index];
            if !segtype.is_empty() && !draft.state.segtypes.contains(&segtype) {
                draft.state.segtypes.push(segtype);
            }
            for dev in devices {
                if !draft.device_names.contains(&dev) {
                    draft.device_names.push(dev);
                }
            }
            continue;
        }

        let name = field(row, "lv_name").to_string();
        let attr = field(row, "lv_attr").to_string();
        let layout = field(row, "lv_layout").to_string();
        let origin = field(row, "origin").to_string();
        let kind = LvKind::classify(&name, &attr, &layout, !origin.is_empty());
        let state = LvState {
            name,
            uuid: uuid.to_string(),
            path: field(row, "lv_path").to_string(),
            size_bytes: num(row, "lv_size", "lvs")?,
            vg_name: field(row, "vg_name").to_string(),
            vg_uuid: field(row, "vg_uuid").to_string(),
            kind,
            data_percent: float(row, "data_percent", "lvs")? as u32,
            attr,
            layout,
            tags: tags(field(row, "lv_tags")),
            active: field(row, "lv_active") == "active",
            segtypes: if segtype.is_empty() { vec![] } else { vec![segtype] },
            ..LvState::default()
        };
        by_uuid.insert(uuid.to_string(), drafts.len());
        drafts.push(LvDraft {
            state,
            pool: field(row, "pool_lv").to_string(),
            pool_uuid: field(row, "pool_lv_uuid").to_string(),
            origin,
            origin_uuid: field(row, "origin_uuid").to_string(),
            data_lv: field(row, "data_lv").to_string(),
            metadata_lv: field(row, "metadata_lv").to_string(),
            device_names: devices,
        });
    }

    // full name → (uuid, kind) for reference resolution
    let known: HashMap<String, (String, LvKind)> = drafts
        .iter()
        .map(|d| (d.state.full_name(), (d.state.uuid.clone(), d.state.kind)))
        .collect();
    let lv_ref = |vg: &str, name: &str, uuid_hint: &str, default: LvKind| -> Option<ObjectRef> {
        if name.is_empty() {
            return None;
        }
        let full = format!("{vg}/{name}");
        let (uuid, kind) = match known.get(&full) {
            Some((uuid, kind)) => (uuid.as_str(), *kind),
            None => (uuid_hint, default),
        };
        Some(ObjectRef::new(Identity::new(uuid, full), kind.handle_kind()))
    };
    let pv_ref = |dev: &str| -> Option<ObjectRef> {
        pv_uuids
            .get(dev)
            .map(|uuid| ObjectRef::new(Identity::new(*uuid, dev), HandleKind::Pv))
    };

    let mut lvs = Vec::with_capacity(drafts.len());
    for draft in &drafts {
        let vg = draft.state.vg_name.as_str();
        let mut state = draft.state.clone();
        state.pool_lv = lv_ref(vg, &draft.pool, &draft.pool_uuid, LvKind::ThinPool);
        state.origin_lv = lv_ref(vg, &draft.origin, &draft.origin_uuid, LvKind::Plain);
        state.data_lv = lv_ref(vg, &draft.data_lv, "", LvKind::Hidden);
        state.metadata_lv = lv_ref(vg, &draft.metadata_lv, "", LvKind::Hidden);
        state.devices = draft.device_names.iter().filter_map(|d| pv_ref(d)).collect();
        lvs.push(state);
    }
    lvs.sort_by_key(|lv| lv.full_name());

    let lv_obj = |lv: &LvState| {
        ObjectRef::new(Identity::new(lv.uuid.as_str(), lv.full_name()), lv.kind.handle_kind())
    };

    let mut pvs = Vec::with_capacity(pv_rows.len());
    for row in pv_rows {
        let name = field(row, "pv_name").to_string();
        let vg_name = field(row, "vg_name");
        pvs.push(PvState {
            uuid: field(row, "pv_uuid").to_string(),
            fmt: field(row, "pv_fmt").to_string(),
            size_bytes: num(row, "pv_size", "pvs")?,
            free_bytes: num(row, "pv_free", "pvs")?,
            used_bytes: num(row, "pv_used", "pvs")?,
            dev_size_bytes: num(row, "dev_size", "pvs")?,
            mda_size_bytes: num(row, "pv_mda_size", "pvs")?,
            mda_free_bytes: num(row, "pv_mda_free", "pvs")?,
            ba_start: num(row, "pv_ba_start", "pvs")?,
            ba_size_bytes: num(row, "pv_ba_size", "pvs")?,
            pe_start: num(row, "pe_start", "pvs")?,
            pe_count: num(row, "pv_pe_count", "pvs")?,
            pe_alloc_count: num(row, "pv_pe_alloc_count", "pvs")?,
            attr: field(row, "pv_attr").to_string(),
            tags: tags(field(row, "pv_tags")),
            vg: (!vg_name.is_empty()).then(|| {
                ObjectRef::new(Identity::new(field(row, "vg_uuid"), vg_name), HandleKind::Vg)
            }),
            lvs: lvs
                .iter()
                .filter(|lv| lv.devices.iter().any(|d| d.identity.name == name))
                .map(lv_obj)
                .collect(),
            name,
        });
    }
    pvs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut vgs = Vec::with_capacity(vg_rows.len());
    for row in vg_rows {
        let name = field(row, "vg_name").to_string();
        vgs.push(VgState {
            uuid: field(row, "vg_uuid").to_string(),
            fmt: field(row, "vg_fmt").to_string(),
            size_bytes: num(row, "vg_size", "vgs")?,
            free_bytes: num(row, "vg_free", "vgs")?,
            sys_id: field(row, "vg_sysid").to_string(),
            extent_size_bytes: num(row, "vg_extent_size", "vgs")?,
            extent_count: num(row, "vg_extent_count", "vgs")?,
            free_count: num(row, "vg_free_count", "vgs")?,
            profile: field(row, "vg_profile").to_string(),
            max_lv: num(row, "max_lv", "vgs")?,
            max_pv: num(row, "max_pv", "vgs")?,
            pv_count: num(row, "pv_count", "vgs")?,
            lv_count: num(row, "lv_count", "vgs")?,
            snap_count: num(row, "snap_count", "vgs")?,
            seqno: num(row, "vg_seqno", "vgs")?,
            mda_count: num(row, "vg_mda_count", "vgs")?,
            mda_free: num(row, "vg_mda_free", "vgs")?,
            mda_size_bytes: num(row, "vg_mda_size", "vgs")?,
            mda_used_count: num(row, "vg_mda_used_count", "vgs")?,
            attr: field(row, "vg_attr").to_string(),
            tags: tags(field(row, "vg_tags")),
            pvs: pvs
                .iter()
                .filter(|pv| pv.vg.as_ref().map_or(false, |vg| vg.identity.name == name))
                .map(|pv| ObjectRef::new(Identity::new(pv.uuid.as_str(), pv.name.as_str()), HandleKind::Pv))
                .collect(),
            lvs: lvs
                .iter()
                .filter(|lv| lv.vg_name == name && lv.kind != LvKind::Hidden)
                .map(lv_obj)
                .collect(),
            name,
        });
    }
    vgs.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Inventory { pvs, vgs, lvs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabular::format_row;

    fn row(columns: &[&str], values: &[&str]) -> Row {
        columns
            .iter()
            .map(|c| c.to_string())
            .zip(values.iter().map(|v| v.to_string()))
            .collect()
    }

    fn lv_row(name: &str, uuid: &str, attr: &str, pool: &str, data: &str, devices: &str) -> Row {
        row(
            LV_COLUMNS,
            &[
                uuid, name, "", "4194304", "vg0", "vg-u", "", pool, "", "", "", attr, "", "active",
                data, "", "", "linear", devices,
            ],
        )
    }

    #[test]
    fn thin_volume_references_its_pool_by_kind() {
        let lvs = [
            lv_row("pool", "p-u", "twi-a-tz--", "", "[pool_tdata]", "pool_tdata(0)"),
            lv_row("[pool_tdata]", "d-u", "Twi-ao----", "", "", "/dev/sda(0)"),
            lv_row("thin", "t-u", "Vwi-a-tz--", "pool", "", ""),
        ];
        let pvs = [row(PV_COLUMNS, &[
            "/dev/sda", "pv-u", "lvm2", "1", "0", "1", "1", "0", "0", "0", "0", "0", "1", "1",
            "a--", "", "vg0", "vg-u",
        ])];
        let inv = build(&pvs, &[], &lvs).expect("build");

        let thin = inv.lvs.iter().find(|lv| lv.name == "thin").expect("thin");
        let pool_ref = thin.pool_lv.as_ref().expect("pool ref");
        assert_eq!(pool_ref.kind, HandleKind::ThinPool);
        assert_eq!(pool_ref.identity, Identity::new("p-u", "vg0/pool"));

        let pool = inv.lvs.iter().find(|lv| lv.name == "pool").expect("pool");
        let data = pool.data_lv.as_ref().expect("data ref");
        assert_eq!(data.kind, HandleKind::HiddenLv);
        assert_eq!(data.identity.uuid(), Some("d-u"));

        assert_eq!(inv.pvs[0].lvs.len(), 1, "only the hidden data volume sits on sda");
    }

    #[test]
    fn segment_rows_merge_into_one_volume() {
        let mut second = lv_row("lv", "l-u", "-wi-a-----", "", "", "/dev/sdb(0)");
        second.insert("segtype".into(), "striped".into());
        let lvs = [lv_row("lv", "l-u", "-wi-a-----", "", "", "/dev/sda(0)"), second];
        let inv = build(&[], &[], &lvs).expect("build");
        assert_eq!(inv.lvs.len(), 1);
        assert_eq!(inv.lvs[0].segtypes, ["linear", "striped"]);
    }

    #[test]
    fn short_rows_are_malformed() {
        let err = rows("vgs", &format_row(&["vg0", "u"]), VG_COLUMNS).unwrap_err();
        assert!(matches!(err, SyncError::Malformed { .. }), "got: {err}");
    }

    #[test]
    fn bad_numbers_are_malformed() {
        let mut values = vec!["x"; VG_COLUMNS.len()];
        values[3] = "12ab";
        let err = build(&[], &[row(VG_COLUMNS, &values)], &[]).unwrap_err();
        assert!(err.to_string().contains("vg_size"), "got: {err}");
    }

    #[test]
    fn moves_pick_destination_from_devices() {
        let out = format_row(&["vg0/[pvmove0]", "/dev/sda", "42.50", "/dev/sda(0),/dev/sdb(0)"]);
        let moves = parse_moves(&out).expect("parse");
        let m = &moves["vg0/[pvmove0]"];
        assert_eq!(m.src_dev, "/dev/sda");
        assert_eq!(m.dest_dev, "/dev/sdb");
        assert!((m.percent - 42.5).abs() < f64::EPSILON);
    }
}
