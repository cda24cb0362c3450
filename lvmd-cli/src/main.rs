//! lvmd: LVM object daemon and its client.
//!
//! # Usage
//!
//! ```text
//! lvmd start [--config <path>] [--udev] [--stall-grace <secs>] [--lvm-binary <path>] [--debug]
//! lvmd stop | status [--json] | refresh | events
//! lvmd lookup <key>
//! lvmd show <object> [--property <name>] [--types]
//! lvmd list [--kind pv|vg|lv|thinpool|cachepool|hiddenlv|job] [--json]
//! lvmd job wait|error|remove <job>
//! lvmd pv create <device> | pv move <src> [<dest>]
//! lvmd vg create <name> <pv>... | vg rename <vg> <name> | vg remove <vg>
//! lvmd lv create <vg> <name> --size <size> | lv remove <lv> | lv move <lv> <src> [<dest>]
//! ```
//!
//! Objects are given either as object paths (`/com/redhat/lvmdbus1/Vg/0`) or
//! as lvm names and UUIDs, which are looked up first.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::{RefreshArgs, StartArgs, StatusArgs},
    inspect::{ListArgs, LookupArgs, ShowArgs},
    job::JobCommand,
    volumes::{LvCommand, PvCommand, VgCommand},
    Client,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "lvmd",
    version,
    about = "Serve and query LVM physical volumes, volume groups and logical volumes",
    long_about = None,
)]
struct Cli {
    /// Daemon socket. Defaults to the configured path.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Start(StartArgs),

    /// Ask a running daemon to shut down.
    Stop,

    /// Show daemon status.
    Status(StatusArgs),

    /// Re-read lvm state now.
    Refresh(RefreshArgs),

    /// Print object events as they happen.
    Events,

    /// Resolve an lvm name or UUID to an object path.
    Lookup(LookupArgs),

    /// Show one object's properties.
    Show(ShowArgs),

    /// List objects.
    List(ListArgs),

    /// Inspect or remove jobs.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Physical volume operations.
    Pv {
        #[command(subcommand)]
        command: PvCommand,
    },

    /// Volume group operations.
    Vg {
        #[command(subcommand)]
        command: VgCommand,
    },

    /// Logical volume operations.
    Lv {
        #[command(subcommand)]
        command: LvCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = || Client::new(cli.socket.clone());
    match cli.command {
        Commands::Start(args) => args.run(cli.socket.clone()),
        Commands::Stop => commands::daemon::stop(&client()),
        Commands::Status(args) => args.run(&client()),
        Commands::Refresh(args) => args.run(&client()),
        Commands::Events => commands::daemon::events(&client()),
        Commands::Lookup(args) => args.run(&client()),
        Commands::Show(args) => args.run(&client()),
        Commands::List(args) => args.run(&client()),
        Commands::Job { command } => commands::job::run(&client(), command),
        Commands::Pv { command } => commands::volumes::run_pv(&client(), command),
        Commands::Vg { command } => commands::volumes::run_vg(&client(), command),
        Commands::Lv { command } => commands::volumes::run_lv(&client(), command),
    }
}
