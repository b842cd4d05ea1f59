//! CLI interface for Bastion
//!
//! Offline tooling for plugin authors and operators, built with clap's derive
//! API. Nothing here talks to a running host.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bastion plugin security toolkit
///
/// Validates plugin manifests, computes the digest a signature must cover, and
/// shows the permission vocabulary, resource presets and active configuration.
#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a manifest file (JSON or TOML)
    Validate {
        /// Path to the manifest
        file: PathBuf,
    },

    /// Print the canonical digest a manifest signature must cover
    Digest {
        /// Path to the manifest
        file: PathBuf,
    },

    /// List the permission vocabulary
    Permissions,

    /// List the resource limit presets
    Presets,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}
