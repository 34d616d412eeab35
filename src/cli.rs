use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::util::parse_duration;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "cacheproxy",
    about = "Forwarding HTTP proxy with an in-memory response cache"
)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./cacheproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Cache entry time-to-live, e.g. `60`, `500ms` or `2m`. Bare numbers are seconds.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Enable debug logging.
    #[arg(long)]
    pub log: bool,
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}
