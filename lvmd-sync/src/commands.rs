//! argv builders for the lvm subcommands the daemon issues.

use std::collections::BTreeMap;

use crate::tabular::SEP;

pub const PV_COLUMNS: &[&str] = &[
    "pv_name",
    "pv_uuid",
    "pv_fmt",
    "pv_size",
    "pv_free",
    "pv_used",
    "dev_size",
    "pv_mda_size",
    "pv_mda_free",
    "pv_ba_start",
    "pv_ba_size",
    "pe_start",
    "pv_pe_count",
    "pv_pe_alloc_count",
    "pv_attr",
    "pv_tags",
    "vg_name",
    "vg_uuid",
];

pub const VG_COLUMNS: &[&str] = &[
    "vg_name",
    "vg_uuid",
    "vg_fmt",
    "vg_size",
    "vg_free",
    "vg_sysid",
    "vg_extent_size",
    "vg_extent_count",
    "vg_free_count",
    "vg_profile",
    "max_lv",
    "max_pv",
    "pv_count",
    "lv_count",
    "snap_count",
    "vg_seqno",
    "vg_mda_count",
    "vg_mda_free",
    "vg_mda_size",
    "vg_mda_used_count",
    "vg_attr",
    "vg_tags",
];

/// Segment-level columns are included, so one LV may span several rows.
pub const LV_COLUMNS: &[&str] = &[
    "lv_uuid",
    "lv_name",
    "lv_path",
    "lv_size",
    "vg_name",
    "vg_uuid",
    "pool_lv_uuid",
    "pool_lv",
    "origin_uuid",
    "origin",
    "data_percent",
    "lv_attr",
    "lv_tags",
    "lv_active",
    "data_lv",
    "metadata_lv",
    "lv_layout",
    "segtype",
    "devices",
];

pub const MOVE_COLUMNS: &[&str] = &["lv_full_name", "move_pv", "copy_percent", "devices"];

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Report command with the fixed formatting flags.
fn report(cmd: &str, extra: &[&str], columns: &[&str]) -> Vec<String> {
    let mut argv = owned(&[
        cmd,
        "--noheadings",
        "--separator",
        SEP,
        "--nosuffix",
        "--unbuffered",
        "--units",
        "b",
    ]);
    argv.extend(owned(extra));
    argv.push("-o".into());
    argv.push(columns.join(","));
    argv
}

pub fn pvs() -> Vec<String> {
    report("pvs", &[], PV_COLUMNS)
}

pub fn vgs() -> Vec<String> {
    report("vgs", &[], VG_COLUMNS)
}

pub fn lvs() -> Vec<String> {
    report("lvs", &["-a"], LV_COLUMNS)
}

/// In-progress moves: rows of the internal pvmove volumes.
pub fn move_status() -> Vec<String> {
    report("lvs", &["-a", "--select", "move_pv!=\"\""], MOVE_COLUMNS)
}

/// Free-form `{key: value}` options to flags. Keys without a leading dash
/// become `--key`; empty values add only the flag.
pub fn options_to_cli_args(options: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in options {
        if key.starts_with('-') {
            args.push(key.clone());
        } else {
            args.push(format!("--{key}"));
        }
        if !value.is_empty() {
            args.push(value.clone());
        }
    }
    args
}

fn with_options(mut argv: Vec<String>, options: &BTreeMap<String, String>) -> Vec<String> {
    argv.extend(options_to_cli_args(options));
    argv
}

pub fn pv_create(devices: &[String], options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["pvcreate", "-y"]), options);
    argv.extend(devices.iter().cloned());
    argv
}

pub fn pv_remove(device: &str, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["pvremove"]), options);
    argv.push(device.to_string());
    argv
}

pub fn vg_create(name: &str, devices: &[String], options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["vgcreate"]), options);
    argv.push(name.to_string());
    argv.extend(devices.iter().cloned());
    argv
}

/// `current` may be the VG name or its UUID.
pub fn vg_rename(current: &str, new_name: &str, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["vgrename"]), options);
    argv.push(current.to_string());
    argv.push(new_name.to_string());
    argv
}

pub fn vg_remove(name: &str, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["vgremove", "-f"]), options);
    argv.push(name.to_string());
    argv
}

pub fn vg_extend(vg: &str, devices: &[String], options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["vgextend"]), options);
    argv.push(vg.to_string());
    argv.extend(devices.iter().cloned());
    argv
}

/// No devices means every unused PV is dropped (`--all`). `missing` also
/// drops PVs lvm can no longer see.
pub fn vg_reduce(
    vg: &str,
    devices: &[String],
    missing: bool,
    options: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut argv = with_options(owned(&["vgreduce"]), options);
    if devices.is_empty() {
        argv.push("--all".into());
    }
    if missing {
        argv.push("--removemissing".into());
    }
    argv.push(vg.to_string());
    argv.extend(devices.iter().cloned());
    argv
}

pub fn lv_create_linear(
    vg: &str,
    name: &str,
    size_bytes: u64,
    options: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut argv = with_options(owned(&["lvcreate", "-y"]), options);
    argv.extend([
        "--size".to_string(),
        format!("{size_bytes}B"),
        "--name".to_string(),
        name.to_string(),
        vg.to_string(),
    ]);
    argv
}

pub fn lv_remove(full_name: &str, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["lvremove", "-f"]), options);
    argv.push(full_name.to_string());
    argv
}

pub fn lv_rename(full_name: &str, new_name: &str, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["lvrename"]), options);
    argv.push(full_name.to_string());
    argv.push(new_name.to_string());
    argv
}

/// Snapshot of `origin` (`vg/lv`). A zero size leaves sizing to lvm, which
/// only works for thin origins.
pub fn lv_snapshot(
    origin: &str,
    name: &str,
    size_bytes: u64,
    options: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut argv = with_options(owned(&["lvcreate"]), options);
    argv.push("-s".into());
    if size_bytes != 0 {
        argv.extend(["--size".to_string(), format!("{size_bytes}B")]);
    }
    argv.extend(["--name".to_string(), name.to_string(), origin.to_string()]);
    argv
}

/// Grow or shrink by `delta` bytes.
pub fn lv_resize(full_name: &str, delta: i64, options: &BTreeMap<String, String>) -> Vec<String> {
    let mut argv = with_options(owned(&["lvresize", "--force"]), options);
    if delta < 0 {
        argv.push(format!("-L-{}B", delta.unsigned_abs()));
    } else {
        argv.push(format!("-L+{delta}B"));
    }
    argv.push(full_name.to_string());
    argv
}

/// Relocate extents off `src`. With `background` lvm detaches and the move is
/// polled; without it progress lines are printed every second.
pub fn pv_move(
    src: &str,
    dest: Option<&str>,
    lv: Option<&str>,
    background: bool,
    options: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut argv = owned(&["pvmove"]);
    if background {
        argv.push("-b".into());
    } else {
        argv.extend(owned(&["-i", "1"]));
    }
    argv = with_options(argv, options);
    if let Some(lv) = lv {
        argv.extend(["-n".to_string(), lv.to_string()]);
    }
    argv.push(src.to_string());
    if let Some(dest) = dest {
        argv.push(dest.to_string());
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_carry_separator_and_units() {
        let argv = vgs();
        assert_eq!(argv[0], "vgs");
        assert!(argv.windows(2).any(|w| w[0] == "--separator" && w[1] == SEP));
        assert!(argv.windows(2).any(|w| w[0] == "--units" && w[1] == "b"));
        assert_eq!(argv.last().map(String::as_str), Some(VG_COLUMNS.join(",").as_str()));
    }

    #[test]
    fn options_become_flags() {
        let options = BTreeMap::from([
            ("-f".to_string(), String::new()),
            ("alloc".to_string(), "anywhere".to_string()),
        ]);
        assert_eq!(options_to_cli_args(&options), ["-f", "--alloc", "anywhere"]);
    }

    #[test]
    fn lv_create_passes_bytes() {
        let argv = lv_create_linear("vg0", "data", 4096, &BTreeMap::new());
        assert_eq!(argv, ["lvcreate", "-y", "--size", "4096B", "--name", "data", "vg0"]);
    }

    #[test]
    fn vg_reduce_without_devices_drops_all_unused() {
        let none = BTreeMap::new();
        assert_eq!(vg_reduce("vg0", &[], false, &none), ["vgreduce", "--all", "vg0"]);
        assert_eq!(
            vg_reduce("vg0", &["/dev/sdb".to_string()], true, &none),
            ["vgreduce", "--removemissing", "vg0", "/dev/sdb"]
        );
    }

    #[test]
    fn lv_resize_signs_the_delta() {
        let none = BTreeMap::new();
        assert_eq!(lv_resize("vg0/data", 4096, &none), ["lvresize", "--force", "-L+4096B", "vg0/data"]);
        assert_eq!(lv_resize("vg0/data", -512, &none), ["lvresize", "--force", "-L-512B", "vg0/data"]);
    }

    #[test]
    fn snapshot_size_is_optional() {
        let none = BTreeMap::new();
        assert_eq!(
            lv_snapshot("vg0/thin", "snap", 0, &none),
            ["lvcreate", "-s", "--name", "snap", "vg0/thin"]
        );
        assert_eq!(
            lv_snapshot("vg0/data", "snap", 1024, &none),
            ["lvcreate", "-s", "--size", "1024B", "--name", "snap", "vg0/data"]
        );
    }

    #[test]
    fn pv_move_modes() {
        let none = BTreeMap::new();
        assert_eq!(
            pv_move("/dev/sda", None, Some("vg0/lv"), true, &none),
            ["pvmove", "-b", "-n", "vg0/lv", "/dev/sda"]
        );
        assert_eq!(
            pv_move("/dev/sda", Some("/dev/sdb"), None, false, &none),
            ["pvmove", "-i", "1", "/dev/sda", "/dev/sdb"]
        );
    }
}
