// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{parse_duration, CliOverrides, DEFAULT_BUILD_FILE};
use crate::types::CacheMode;

/// Command-line arguments for `kiln`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Incremental, cached execution of a task graph.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the build file (TOML).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_BUILD_FILE, global = true)]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `KILN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(flatten)]
    pub build: BuildArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Flags for a build run.
#[derive(Debug, Clone, Default, Args)]
pub struct BuildArgs {
    /// Upper bound on concurrently running tasks.
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Use the build cache (`on`) or bypass it entirely (`off`).
    #[arg(long, value_enum, value_name = "MODE")]
    pub build_cache: Option<CacheModeArg>,

    /// Never contact the remote cache.
    #[arg(long)]
    pub offline: bool,

    /// Keep running independent tasks after a failure.
    #[arg(long = "continue")]
    pub continue_on_failure: bool,

    /// Ignore history and cached results; run every task.
    #[arg(long)]
    pub rerun: bool,

    /// Parse + validate, print the execution plan, but don't run any task.
    #[arg(long)]
    pub dry_run: bool,
}

impl BuildArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            max_workers: self.max_workers,
            build_cache: self.build_cache.map(CacheMode::from),
            offline: self.offline,
            continue_on_failure: self.continue_on_failure,
            rerun: self.rerun,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Inspect or clean the local build cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum CacheCommand {
    /// Print the number of entries and their total size.
    Stats,
    /// Remove entries not used within `--max-age`.
    Prune {
        /// Age such as `12h` or `7d`.
        #[arg(long, value_name = "DURATION", default_value = "7d", value_parser = parse_duration)]
        max_age: std::time::Duration,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum CacheModeArg {
    On,
    Off,
}

impl From<CacheModeArg> for CacheMode {
    fn from(arg: CacheModeArg) -> Self {
        match arg {
            CacheModeArg::On => CacheMode::On,
            CacheModeArg::Off => CacheMode::Off,
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
