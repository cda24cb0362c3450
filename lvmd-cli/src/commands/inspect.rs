//! `lvmd lookup|show|list`: read-only queries.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use super::{print_json, Client};

#[derive(Args, Debug)]
pub struct LookupArgs {
    /// lvm name (`vg0`, `vg0/data`, `/dev/sda`) or UUID.
    pub key: String,
}

impl LookupArgs {
    pub fn run(self, client: &Client) -> Result<()> {
        let found = client.call("lookup", json!({ "key": self.key }), None)?;
        println!("{}", found["handle"].as_str().unwrap_or("/"));
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Object path, lvm name or UUID.
    pub object: String,

    /// Print a single property.
    #[arg(long)]
    pub property: Option<String>,

    /// Print property names with their type signatures instead of values.
    #[arg(long, conflicts_with = "property")]
    pub types: bool,
}

impl ShowArgs {
    pub fn run(self, client: &Client) -> Result<()> {
        let handle = client.resolve(&self.object)?;
        if let Some(property) = self.property {
            let found = client.call("get", json!({ "handle": handle, "property": property }), None)?;
            println!("{}", render_value(&found["value"]));
            return Ok(());
        }
        if self.types {
            let found = client.call("introspect", json!({ "handle": handle }), None)?;
            for prop in found["properties"].as_array().into_iter().flatten() {
                println!(
                    "{:<24} {}",
                    prop["name"].as_str().unwrap_or("?"),
                    prop["type"].as_str().unwrap_or("?")
                );
            }
            return Ok(());
        }

        let object = client.call("get_all", json!({ "handle": handle }), None)?;
        println!("{handle}");
        let properties = object["properties"]
            .as_object()
            .context("daemon returned no properties")?;
        for (name, value) in properties {
            println!("  {name:<22} {}", render_value(value));
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only objects of this kind (pv, vg, lv, thinpool, cachepool, hiddenlv, job).
    #[arg(long)]
    pub kind: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ObjectRow {
    #[tabled(rename = "object")]
    handle: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "uuid")]
    uuid: String,
}

impl ListArgs {
    pub fn run(self, client: &Client) -> Result<()> {
        let objects = client.call("list", json!({ "kind": self.kind }), None)?;
        if self.json {
            return print_json(&objects);
        }

        let rows: Vec<ObjectRow> = objects
            .as_array()
            .into_iter()
            .flatten()
            .map(|object| ObjectRow {
                handle: object["handle"].as_str().unwrap_or("?").to_string(),
                name: object["properties"]["Name"].as_str().unwrap_or("").to_string(),
                uuid: object["properties"]["Uuid"].as_str().unwrap_or("").to_string(),
            })
            .collect();
        if rows.is_empty() {
            println!("No objects.");
            return Ok(());
        }
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        other => other.to_string(),
    }
}
