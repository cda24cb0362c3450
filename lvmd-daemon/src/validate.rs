//! Name checks applied before any command is issued.

use crate::error::RequestError;

const RESERVED_LV_SUBSTRINGS: &[&str] = &[
    "_cdata", "_cmeta", "_corig", "_mimage", "_mlog", "_pmspare", "_rimage", "_rmeta", "_tdata",
    "_tmeta", "_vorigin",
];

const RESERVED_LV_PREFIXES: &[&str] = &["snapshot", "pvmove"];

const MAX_VG_NAME: usize = 127;
const MAX_VG_LV_NAME: usize = 125;

fn invalid(msg: String) -> RequestError {
    RequestError::InvalidArgument(msg)
}

fn name_chars_ok(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '_' | '-'))
}

pub fn vg_name(name: &str) -> Result<(), RequestError> {
    if name.is_empty() || name.len() > MAX_VG_NAME {
        return Err(invalid(format!(
            "volume group name must be 1..{MAX_VG_NAME} characters: {name:?}"
        )));
    }
    if name == "." || name == ".." {
        return Err(invalid(format!("volume group name {name:?} is reserved")));
    }
    if name.starts_with('-') {
        return Err(invalid(format!("volume group name {name:?} starts with '-'")));
    }
    if !name_chars_ok(name) {
        return Err(invalid(format!(
            "volume group name {name:?} has characters outside [A-Za-z0-9.+_-]"
        )));
    }
    Ok(())
}

pub fn lv_name(vg: &str, name: &str) -> Result<(), RequestError> {
    vg_name(name).map_err(|_| {
        invalid(format!(
            "logical volume name {name:?} must be 1..{MAX_VG_NAME} characters of [A-Za-z0-9.+_-], not '.', '..' or starting with '-'"
        ))
    })?;
    if vg.len() + name.len() > MAX_VG_LV_NAME {
        return Err(invalid(format!(
            "combined length of {vg:?} and {name:?} exceeds {MAX_VG_LV_NAME}"
        )));
    }
    if let Some(prefix) = RESERVED_LV_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        return Err(invalid(format!("logical volume names may not start with {prefix:?}")));
    }
    if let Some(reserved) = RESERVED_LV_SUBSTRINGS.iter().find(|r| name.contains(*r)) {
        return Err(invalid(format!("logical volume names may not contain {reserved:?}")));
    }
    Ok(())
}

pub fn device_path(path: &str) -> Result<(), RequestError> {
    let ok = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "#+.:=@_/%-".contains(c));
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("device path {path:?} is not valid")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vg_names() {
        for ok in ["vg0", "data.vg", "a+b_c-d", "x".repeat(127).as_str()] {
            assert!(vg_name(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", ".", "..", "-vg", "vg 0", "vg/0", "x".repeat(128).as_str()] {
            assert!(vg_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn lv_names() {
        assert!(lv_name("vg0", "data").is_ok());
        assert!(lv_name("vg0", "snapshot1").is_err());
        assert!(lv_name("vg0", "pvmove0").is_err());
        assert!(lv_name("vg0", "data_tmeta").is_err());
        assert!(lv_name("vg0", "x_rimage_1").is_err());
        assert!(lv_name(&"v".repeat(100), &"l".repeat(26)).is_err());
        assert!(lv_name(&"v".repeat(100), &"l".repeat(25)).is_ok());
    }

    #[test]
    fn device_paths() {
        assert!(device_path("/dev/disk/by-id/wwn-0x5000c500a1b2c3d4").is_ok());
        assert!(device_path("/dev/mapper/luks-1").is_ok());
        assert!(device_path("/dev/sda; rm -rf /").is_err());
        assert!(device_path("").is_err());
    }
}
