//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the TOML file and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Tag, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Delivers stored alerts to Slack webhooks with bounded retries.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run one ingest pass and one dispatch cycle, then exit.
    #[arg(long)]
    pub once: bool,

    /// Directory scanned for `alert-*.json` files.
    #[arg(long, value_name = "DIR")]
    pub alerts_dir: Option<PathBuf>,

    /// Maximum deliveries processed per dispatch cycle.
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Seconds between dispatch cycles.
    #[arg(long, value_name = "SECONDS")]
    pub interval_seconds: Option<u64>,

    /// Use the SQLite repository stored at this path.
    #[arg(long, value_name = "FILE")]
    pub sqlite_path: Option<PathBuf>,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(dir) = &self.alerts_dir {
            set_path(&mut dict, &["alerts_dir"], Value::from(dir.display().to_string()));
        }

        if let Some(batch_size) = self.batch_size {
            set_path(
                &mut dict,
                &["db_dispatcher", "batch_size"],
                Value::from(batch_size as u64),
            );
        }

        if let Some(interval) = self.interval_seconds {
            set_path(&mut dict, &["db_dispatcher", "interval_seconds"], Value::from(interval));
        }

        // Naming a database file implies the SQLite backend.
        if let Some(path) = &self.sqlite_path {
            set_path(&mut dict, &["storage", "backend"], Value::from("sqlite"));
            set_path(
                &mut dict,
                &["storage", "sqlite_path"],
                Value::from(path.display().to_string()),
            );
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}

fn set_path(dict: &mut Dict, path: &[&str], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            dict.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = dict
                .entry((*head).to_string())
                .or_insert_with(|| Value::Dict(Tag::Default, Dict::new()));
            if let Value::Dict(_, child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}
