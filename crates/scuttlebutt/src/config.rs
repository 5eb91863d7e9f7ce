//! Configuration for scuttled

use crate::session::SessionOptions;
use anyhow::Context;
use clap::Parser;
use scuttlebutt_core::SourceId;
use serde_json::Value;
use std::net::SocketAddr;

/// scuttled - Scuttlebutt key/value replication daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "scuttled")]
#[command(about = "Scuttlebutt key/value replication daemon")]
pub struct Config {
    /// Listen address for replication connections
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Replica id (random when unset)
    #[arg(long, env = "SCUTTLE_ID")]
    pub id: Option<String>,

    /// Peers to dial on startup (comma-separated addresses)
    #[arg(long = "peer", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Initial local write, KEY=VALUE (VALUE parsed as JSON, else a string)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Close each session once both sides have synced
    #[arg(long)]
    pub one_shot: bool,

    /// Interval between stats log lines, in seconds
    #[arg(long, default_value = "30")]
    pub stats_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.id {
            SourceId::new(id.as_str()).with_context(|| format!("Invalid replica id {:?}", id))?;
        }
        self.initial_writes()?;
        if self.stats_interval_secs == 0 {
            anyhow::bail!("Stats interval must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    /// Configured replica id, or a fresh random one
    pub fn source_id(&self) -> anyhow::Result<SourceId> {
        match &self.id {
            Some(id) => Ok(SourceId::new(id.as_str())?),
            None => Ok(SourceId::random()),
        }
    }

    /// Parsed `--set` entries
    pub fn initial_writes(&self) -> anyhow::Result<Vec<(String, Value)>> {
        self.set.iter().map(|entry| parse_write(entry)).collect()
    }

    /// Options for every session the daemon opens
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default().with_tail(!self.one_shot)
    }
}

fn parse_write(entry: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, raw)) = entry.split_once('=') else {
        anyhow::bail!("Expected KEY=VALUE, got {:?}", entry);
    };
    if key.is_empty() {
        anyhow::bail!("Empty key in {:?}", entry);
    }
    scuttlebutt_core::types::ensure_legal_key(key)?;

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
