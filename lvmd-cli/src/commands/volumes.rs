//! `lvmd pv|vg|lv`: mutating operations.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use lvmd_core::Handle;
use lvmd_daemon::protocol::{
    LvCreateArgs, LvMoveArgs, LvRenameArgs, LvResizeArgs, LvSnapshotArgs, PvCreateArgs, PvMoveArgs,
    RemoveArgs, VgCreateArgs, VgExtendArgs, VgReduceArgs, VgRenameArgs,
};

use super::{outcome_line, Client};

/// Options common to every mutation.
#[derive(Args, Debug, Clone)]
pub struct OpArgs {
    /// Seconds to wait: -1 blocks, 0 returns a job immediately.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub timeout: i64,

    /// Extra lvm flag, repeatable: `--option --alloc=anywhere`, `--option -v`.
    #[arg(long = "option", value_name = "FLAG[=VALUE]", allow_hyphen_values = true)]
    pub options: Vec<String>,
}

impl OpArgs {
    fn options(&self) -> Result<BTreeMap<String, String>> {
        self.options
            .iter()
            .map(|raw| {
                let (flag, value) = raw.split_once('=').unwrap_or((raw.as_str(), ""));
                if !flag.starts_with('-') {
                    bail!("option '{raw}' must start with '-'");
                }
                Ok((flag.to_string(), value.to_string()))
            })
            .collect()
    }
}

#[derive(Subcommand, Debug)]
pub enum PvCommand {
    /// Initialize a device as a physical volume.
    Create {
        device: String,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Wipe the label from a physical volume outside any group.
    Remove {
        pv: String,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Move all extents off a physical volume, reporting progress.
    Move {
        src: String,
        dest: Option<String>,
        #[command(flatten)]
        op: OpArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum VgCommand {
    /// Create a volume group from physical volumes.
    Create {
        name: String,
        #[arg(required = true)]
        pvs: Vec<String>,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Rename a volume group.
    Rename {
        vg: String,
        name: String,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Add physical volumes to a group.
    Extend {
        vg: String,
        #[arg(required = true)]
        pvs: Vec<String>,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Drop physical volumes from a group; none given drops every unused one.
    Reduce {
        vg: String,
        pvs: Vec<String>,
        /// Also drop physical volumes lvm can no longer find.
        #[arg(long)]
        missing: bool,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Remove a volume group.
    Remove {
        vg: String,
        #[command(flatten)]
        op: OpArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum LvCommand {
    /// Create a linear logical volume.
    Create {
        vg: String,
        name: String,
        /// Size in bytes or with a K/M/G/T suffix (binary units).
        #[arg(long, value_parser = parse_size)]
        size: u64,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Remove a logical volume.
    Remove {
        lv: String,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Rename a logical volume within its group.
    Rename {
        lv: String,
        name: String,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Snapshot a logical volume.
    Snapshot {
        lv: String,
        name: String,
        /// Defaults to 1/80th of a thick origin.
        #[arg(long, value_parser = parse_size)]
        size: Option<u64>,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Set a logical volume's size.
    Resize {
        lv: String,
        #[arg(long, value_parser = parse_size)]
        size: u64,
        #[command(flatten)]
        op: OpArgs,
    },
    /// Move one logical volume's extents off a physical volume in the background.
    Move {
        lv: String,
        src: String,
        dest: Option<String>,
        #[command(flatten)]
        op: OpArgs,
    },
}

fn resolve_all(client: &Client, keys: &[String]) -> Result<Vec<Handle>> {
    keys.iter().map(|key| client.resolve(key)).collect()
}

fn submit<T: Serialize>(client: &Client, cmd: &str, args: &T, op: &OpArgs) -> Result<()> {
    let args = serde_json::to_value(args).context("failed to encode arguments")?;
    let outcome = client.call(cmd, args, Some(op.timeout))?;
    println!("{}", outcome_line(&outcome));
    Ok(())
}

pub fn run_pv(client: &Client, command: PvCommand) -> Result<()> {
    match command {
        PvCommand::Create { device, op } => {
            let args = PvCreateArgs {
                device,
                options: op.options()?,
            };
            submit(client, "pv_create", &args, &op)
        }
        PvCommand::Remove { pv, op } => {
            let args = RemoveArgs {
                handle: client.resolve(&pv)?,
                options: op.options()?,
            };
            submit(client, "pv_remove", &args, &op)
        }
        PvCommand::Move { src, dest, op } => {
            let args = PvMoveArgs {
                src: client.resolve(&src)?,
                dest: dest.map(|d| client.resolve(&d)).transpose()?,
                options: op.options()?,
            };
            submit(client, "pv_move", &args, &op)
        }
    }
}

pub fn run_vg(client: &Client, command: VgCommand) -> Result<()> {
    match command {
        VgCommand::Create { name, pvs, op } => {
            let args = VgCreateArgs {
                name,
                pvs: resolve_all(client, &pvs)?,
                options: op.options()?,
            };
            submit(client, "vg_create", &args, &op)
        }
        VgCommand::Extend { vg, pvs, op } => {
            let args = VgExtendArgs {
                vg: client.resolve(&vg)?,
                pvs: resolve_all(client, &pvs)?,
                options: op.options()?,
            };
            submit(client, "vg_extend", &args, &op)
        }
        VgCommand::Reduce { vg, pvs, missing, op } => {
            let args = VgReduceArgs {
                vg: client.resolve(&vg)?,
                pvs: resolve_all(client, &pvs)?,
                missing,
                options: op.options()?,
            };
            submit(client, "vg_reduce", &args, &op)
        }
        VgCommand::Rename { vg, name, op } => {
            let args = VgRenameArgs {
                vg: client.resolve(&vg)?,
                name,
                options: op.options()?,
            };
            submit(client, "vg_rename", &args, &op)
        }
        VgCommand::Remove { vg, op } => {
            let args = RemoveArgs {
                handle: client.resolve(&vg)?,
                options: op.options()?,
            };
            submit(client, "vg_remove", &args, &op)
        }
    }
}

pub fn run_lv(client: &Client, command: LvCommand) -> Result<()> {
    match command {
        LvCommand::Create { vg, name, size, op } => {
            let args = LvCreateArgs {
                vg: client.resolve(&vg)?,
                name,
                size_bytes: size,
                options: op.options()?,
            };
            submit(client, "lv_create_linear", &args, &op)
        }
        LvCommand::Remove { lv, op } => {
            let args = RemoveArgs {
                handle: client.resolve(&lv)?,
                options: op.options()?,
            };
            submit(client, "lv_remove", &args, &op)
        }
        LvCommand::Rename { lv, name, op } => {
            let args = LvRenameArgs {
                lv: client.resolve(&lv)?,
                name,
                options: op.options()?,
            };
            submit(client, "lv_rename", &args, &op)
        }
        LvCommand::Snapshot { lv, name, size, op } => {
            let args = LvSnapshotArgs {
                lv: client.resolve(&lv)?,
                name,
                size_bytes: size.unwrap_or(0),
                options: op.options()?,
            };
            submit(client, "lv_snapshot", &args, &op)
        }
        LvCommand::Resize { lv, size, op } => {
            let args = LvResizeArgs {
                lv: client.resolve(&lv)?,
                size_bytes: size,
                options: op.options()?,
            };
            submit(client, "lv_resize", &args, &op)
        }
        LvCommand::Move { lv, src, dest, op } => {
            let args = LvMoveArgs {
                lv: client.resolve(&lv)?,
                src: client.resolve(&src)?,
                dest: dest.map(|d| client.resolve(&d)).transpose()?,
                options: op.options()?,
            };
            submit(client, "lv_move", &args, &op)
        }
    }
}

/// `4096`, `512K`, `10M`, `1.5G`, `2T`; case-insensitive, optional trailing `B`/`iB`.
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let body = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);
    let (number, shift) = match body.chars().last() {
        Some('k') => (&body[..body.len() - 1], 10),
        Some('m') => (&body[..body.len() - 1], 20),
        Some('g') => (&body[..body.len() - 1], 30),
        Some('t') => (&body[..body.len() - 1], 40),
        _ => (body, 0),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{raw}'"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("size must be positive: '{raw}'"));
    }
    let bytes = value * (1u64 << shift) as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("size too large: '{raw}'"));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("512K"), Ok(512 << 10));
        assert_eq!(parse_size("10m"), Ok(10 << 20));
        assert_eq!(parse_size("1.5G"), Ok(3 << 29));
        assert_eq!(parse_size("2TiB"), Ok(2 << 40));
        assert_eq!(parse_size("8GB"), Ok(8 << 30));
        assert!(parse_size("0").is_err());
        assert!(parse_size("-1G").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn options_split_on_equals() {
        let op = OpArgs {
            timeout: -1,
            options: vec!["--alloc=anywhere".into(), "-v".into()],
        };
        let options = op.options().expect("options");
        assert_eq!(options.get("--alloc").map(String::as_str), Some("anywhere"));
        assert_eq!(options.get("-v").map(String::as_str), Some(""));

        let bad = OpArgs {
            timeout: -1,
            options: vec!["alloc=anywhere".into()],
        };
        assert!(bad.options().is_err());
    }
}
