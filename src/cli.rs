//! Command-line interface parsing for posterkit
//!
//! This module handles parsing of CLI arguments using clap and turns them into
//! the renderer and HTTP client settings used at startup.

use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::remote::FetchConfig;
use crate::render::RenderConfig;

/// File name of the store inside the cache directory
const STORE_FILE_NAME: &str = "cache.db";

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// No --store given and no home directory to derive one from
    #[error("Cannot determine a cache directory; pass --store <PATH>")]
    NoStorePath,

    /// The render timeout must be positive
    #[error("Invalid timeout: must be at least 1 second")]
    InvalidTimeout,

    /// Output keys must not be empty
    #[error("Invalid cache key: must not be empty")]
    EmptyKey,
}

/// posterkit - Compose poster images from layered sources
#[derive(Parser, Debug)]
#[command(name = "posterkit")]
#[command(about = "Compose poster images from local and remote layers with a persistent cache")]
#[command(version)]
pub struct Cli {
    /// Path to the cache store file (defaults to the user cache directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a layout file to PNG
    Render(RenderArgs),
    /// Remove expired and unreadable entries from the cache store
    Purge,
}

/// Arguments for `posterkit render`
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Layout JSON file describing the background, images, lines, and texts
    #[arg(value_name = "LAYOUT")]
    pub layout: PathBuf,

    /// Where to write the PNG
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Cache the rendered output under this key and reuse it while fresh
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,

    /// Seconds allowed for loading all image sources
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Hours a rendered output stays cached
    #[arg(long, default_value_t = 48)]
    pub output_ttl_hours: u64,

    /// Hours a downloaded remote image stays cached
    #[arg(long, default_value_t = 120)]
    pub remote_ttl_hours: u64,

    /// Accept invalid TLS certificates from image hosts
    #[arg(long)]
    pub insecure: bool,
}

/// Settings derived from `render` arguments
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub render: RenderConfig,
    pub fetch: FetchConfig,
    pub key: Option<String>,
}

impl RenderSettings {
    /// Creates RenderSettings from parsed render arguments.
    ///
    /// # Returns
    /// * `Ok(RenderSettings)` with durations converted from CLI units
    /// * `Err(CliError)` if the timeout is zero or the key is empty
    pub fn from_args(args: &RenderArgs) -> Result<Self, CliError> {
        if args.timeout_secs == 0 {
            return Err(CliError::InvalidTimeout);
        }
        if args.key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(CliError::EmptyKey);
        }

        let timeout = Duration::from_secs(args.timeout_secs);
        Ok(RenderSettings {
            render: RenderConfig {
                timeout,
                output_ttl: hours(args.output_ttl_hours),
                remote_ttl: hours(args.remote_ttl_hours),
            },
            fetch: FetchConfig {
                request_timeout: timeout,
                accept_invalid_certs: args.insecure,
            },
            key: args.key.clone(),
        })
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

/// Default store location in the XDG-compliant cache directory
///
/// Uses `~/.cache/posterkit/cache.db` on Linux, or the platform equivalent.
pub fn default_store_path() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "posterkit")?;
    Some(project_dirs.cache_dir().join(STORE_FILE_NAME))
}

/// Picks the explicit store path if given, otherwise the default location
pub fn resolve_store_path(explicit: Option<&Path>) -> Result<PathBuf, CliError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => default_store_path().ok_or(CliError::NoStorePath),
    }
}
