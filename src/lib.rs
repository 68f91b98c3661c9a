// src/lib.rs

pub mod action;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod history;
pub mod logging;
pub mod scheduler;
pub mod snapshot;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::build::BuildSession;
use crate::cache::LocalBuildCache;
use crate::cli::{CacheCommand, CliArgs, Command};
use crate::config::{declarations, load_and_validate, project_root, BuildSettings};
use crate::fs::RealFileSystem;
use crate::graph::ExecutionPlan;

/// High-level entry point used by `main.rs`. Returns the process exit code.
///
/// This wires together:
/// - build file loading and settings resolution
/// - task registration and planning
/// - the build session (snapshots, fingerprints, cache, scheduler)
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<i32> {
    let config_path = PathBuf::from(&args.config);
    let file = load_and_validate(&config_path)?;
    let root = project_root(&config_path);
    let settings = BuildSettings::resolve(
        &root,
        &file.build,
        |key| std::env::var(key).ok(),
        &args.build.overrides(),
    )?;

    if let Some(Command::Cache { action }) = &args.command {
        return run_cache_command(action, &settings);
    }

    let mut session = BuildSession::new(&root, settings);
    for decl in declarations(&file)? {
        session.register(decl)?;
    }

    if args.build.dry_run {
        let plan = session.plan()?;
        print_dry_run(&plan, session.settings());
        return Ok(0);
    }

    // Ctrl-C -> stop dispatching, let in-flight tasks wind down.
    {
        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received; cancelling build");
            cancel.cancel();
        });
    }

    let outcome = session.execute().await?;
    if let Some(fatal) = &outcome.fatal {
        error!(error = %fatal, "build aborted");
    } else if outcome.cancelled {
        info!(summary = %outcome.summary, "build cancelled");
    } else if outcome.summary.failed > 0 {
        error!(summary = %outcome.summary, "BUILD FAILED");
    } else {
        info!(summary = %outcome.summary, "BUILD SUCCESSFUL");
    }
    Ok(outcome.exit_code())
}

fn run_cache_command(action: &CacheCommand, settings: &BuildSettings) -> Result<i32> {
    let cache = LocalBuildCache::new(&settings.cache_dir, Arc::new(RealFileSystem));
    match action {
        CacheCommand::Stats => {
            let stats = cache.stats()?;
            println!("cache: {}", cache.root().display());
            println!("  entries: {}", stats.entries);
            println!("  bytes:   {}", stats.bytes);
        }
        CacheCommand::Prune { max_age } => {
            let pruned = cache.prune(*max_age)?;
            println!(
                "removed {} entries ({} bytes) from {}",
                pruned.removed,
                pruned.bytes_freed,
                cache.root().display()
            );
        }
    }
    Ok(0)
}

/// Print settings and the plan's waves without executing anything.
fn print_dry_run(plan: &ExecutionPlan, settings: &BuildSettings) {
    println!("kiln dry-run");
    println!("  build.max_workers = {}", settings.max_workers);
    println!("  build.build_cache = {:?}", settings.cache_mode);
    println!("  build.offline = {}", settings.offline);
    println!("  build.continue_on_failure = {}", settings.continue_on_failure);
    if let Some(remote) = &settings.remote {
        println!("  build.remote.url = {} (push: {})", remote.url, remote.push);
    }
    println!();
    print!("{}", plan.describe());

    debug!("dry-run complete (no execution)");
}
