use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::backends::Backend;

/// Live tail and publish console for Pub/Sub topics.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Number of messages retained per topic.
    #[arg(long)]
    pub max_messages: Option<usize>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Queue backend to use.
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Ensure topics and subscriptions exist, then serve (default).
    #[default]
    Run,
    /// Print the configured topics and their subscriptions.
    Topics,
}
