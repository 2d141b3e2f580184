// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal-driven log-level control.
//!
//! SIGUSR2 raises the level one step (idempotent at `debug`), SIGUSR1
//! restores the configured level. The handlers only set atomic flags; the
//! single-threaded run loop polls them between reactor iterations, so the
//! actual level change happens outside async-signal context.

use crate::logging::{self, Level};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SignalFlags {
    restore: Arc<AtomicBool>,
    raise: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Register the SIGUSR1/SIGUSR2 handlers.
    pub fn install() -> io::Result<Self> {
        let restore = Arc::new(AtomicBool::new(false));
        let raise = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&restore))?;
        signal_hook::flag::register(signal_hook::consts::SIGUSR2, Arc::clone(&raise))?;
        Ok(Self { restore, raise })
    }

    /// Apply any pending level change. Called once per loop iteration.
    pub fn poll(&self, configured: Level) {
        if self.raise.swap(false, Ordering::Relaxed) {
            let level = logging::bump_level();
            log::info!("log level raised to {}", level.as_str());
        }
        if self.restore.swap(false, Ordering::Relaxed) {
            logging::set_level(configured);
            log::info!("log level restored to {}", configured.as_str());
        }
    }
}
