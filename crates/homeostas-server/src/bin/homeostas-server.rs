// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Homeostas foreground process: a single binary composing the catalog,
//! connection plane, and session crates under one supervisor (C14, §6
//! "Process interface").

use anyhow::Result;
use clap::Parser;
use homeostas_server::AppContext;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "homeostas-server")]
#[command(about = "Homeostas peer-to-peer directory synchronization engine", long_about = None)]
struct Args {
    /// Home directory holding the configuration, discovery, and catalog
    /// databases. Defaults to `~/.homeostas`.
    #[arg(long)]
    home: Option<PathBuf>,

    /// No-op placeholder for the out-of-scope GUI front end; threaded
    /// through so that collaborator can omit it.
    #[arg(long)]
    headless: bool,

    /// Directory to track, may be repeated.
    #[arg(long = "track")]
    track: Vec<PathBuf>,
}

fn default_home() -> PathBuf {
    dirs_home().join(".homeostas")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn main() -> Result<()> {
    homeostas_logger::init();

    let args = Args::parse();
    if !args.headless {
        tracing::warn!("the GUI front end is out of scope; running headless regardless");
    }
    let home = args.home.unwrap_or_else(default_home);

    tracing::info!(home = %home.display(), "homeostas starting");
    let context = Arc::new(AppContext::startup(&home)?);

    for dir in &args.track {
        tracing::info!(dir = %dir.display(), "tracking directory");
        context.track(dir)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = stop.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        stop_for_handler.store(true, Ordering::SeqCst);
    })?;

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    context.shutdown();
    Ok(())
}
