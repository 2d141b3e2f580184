// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! pvmapper daemon entry point.
//!
//! ```bash
//! pvmapper /etc/pvmapper.conf
//! ```
//!
//! The configuration file selects the listen and upstream search
//! addresses, access-control rules and logging; see the crate
//! documentation for the data path. Send SIGUSR2 to raise the log level a
//! step, SIGUSR1 to restore the configured one.

use anyhow::Context;
use clap::Parser;
use pvmapper::config::Config;
use pvmapper::engine::{Engine, POLL_TIMEOUT};
use pvmapper::logging;
use pvmapper::signals::SignalFlags;
use std::path::PathBuf;

/// Channel Access name server: answers PV searches from cache and resolves
/// misses across upstream broadcast domains.
#[derive(Parser, Debug)]
#[command(name = "pvmapper", version, about, long_about = None)]
struct Args {
    /// Configuration file
    config_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config_file)
        .with_context(|| format!("failed to read {}", args.config_file.display()))?;
    let configured_level = config.log_level;

    logging::init(&config).context("logger already installed")?;
    let signals = SignalFlags::install().context("failed to install signal handlers")?;

    let mut engine = Engine::new(config).context("initialization failed")?;
    log::info!(
        "pvmapper {} started, log level {}",
        env!("CARGO_PKG_VERSION"),
        configured_level.as_str()
    );

    loop {
        engine
            .run_once(POLL_TIMEOUT)
            .context("reactor loop failed")?;
        signals.poll(configured_level);
    }
}
