//! `lvmd job`: follow long-running operations.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::json;

use super::Client;

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    /// Block until the job completes, then print its result.
    Wait(WaitArgs),
    /// Print the job's error code and message.
    Error { job: String },
    /// Forget a completed job.
    Remove { job: String },
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    pub job: String,

    /// Give up after this many seconds.
    #[arg(long)]
    pub seconds: Option<i64>,
}

pub fn run(client: &Client, command: JobCommand) -> Result<()> {
    match command {
        JobCommand::Wait(args) => {
            let handle = client.resolve(&args.job)?;
            let waited = client.call(
                "job_wait",
                json!({ "handle": handle, "seconds": args.seconds }),
                None,
            )?;
            let props = &waited["properties"];
            if waited["complete"] != json!(true) {
                println!("{} {handle} at {}%", "still running".yellow(), props["Percent"]);
                return Ok(());
            }
            let code = props["GetError"][0].as_i64().unwrap_or(0);
            if code != 0 {
                bail!(
                    "job {handle} failed with code {code}: {}",
                    props["GetError"][1].as_str().unwrap_or("")
                );
            }
            println!("{} {handle} -> {}", "complete".green(), props["Result"]);
        }
        JobCommand::Error { job } => {
            let handle = client.resolve(&job)?;
            let error = client.call("job_get_error", json!({ "handle": handle }), None)?;
            println!("{} {}", error["code"], error["message"].as_str().unwrap_or(""));
        }
        JobCommand::Remove { job } => {
            let handle = client.resolve(&job)?;
            client.call("job_remove", json!({ "handle": handle }), None)?;
            println!("removed {handle}");
        }
    }
    Ok(())
}
