// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging backend behind the `log` facade.
//!
//! Operators see four levels: `error < info < verbose < debug`. They map
//! onto the facade as error->Error, info->Info, verbose->Debug and
//! debug->Trace, so `log::debug!` records carry the `VERBOSE` tag and
//! `log::trace!` records the `DEBUG` tag. The threshold is runtime-mutable
//! to support the SIGUSR1/SIGUSR2 toggles.
//!
//! Output goes either to stderr (timestamped lines) or to syslog(3) when a
//! facility is configured.

mod output;

pub use output::{Output, StderrOutput, SyslogOutput};

use crate::config::Config;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// Operator-facing log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Info = 1,
    Verbose = 2,
    Debug = 3,
}

impl Level {
    /// Parse a config value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "info" => Some(Self::Info),
            "verbose" => Some(Self::Verbose),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Info => "info",
            Self::Verbose => "verbose",
            Self::Debug => "debug",
        }
    }

    /// One step more verbose; idempotent at `debug`.
    pub fn bump(self) -> Self {
        match self {
            Self::Error => Self::Info,
            Self::Info => Self::Verbose,
            Self::Verbose | Self::Debug => Self::Debug,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Info,
            2 => Self::Verbose,
            _ => Self::Debug,
        }
    }

    fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Info => log::LevelFilter::Info,
            Self::Verbose => log::LevelFilter::Debug,
            Self::Debug => log::LevelFilter::Trace,
        }
    }
}

/// Rank of a facade record on the operator scale.
fn record_rank(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn | log::Level::Info => Level::Info,
        log::Level::Debug => Level::Verbose,
        log::Level::Trace => Level::Debug,
    }
}

/// Display tag for a facade record.
pub(crate) fn record_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN",
        log::Level::Info => "INFO",
        log::Level::Debug => "VERBOSE",
        log::Level::Trace => "DEBUG",
    }
}

struct Logger {
    level: AtomicU8,
    output: Box<dyn Output>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        record_rank(metadata.level()) <= Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.output
                .write(record.level(), &format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<&'static Logger> = OnceLock::new();

/// Install the global logger from the configuration. Subsequent calls are
/// ignored (first installation wins).
pub fn init(config: &Config) -> Result<(), log::SetLoggerError> {
    let output: Box<dyn Output> = match &config.syslog_facility {
        Some(facility) => Box::new(SyslogOutput::open(&config.syslog_ident, facility)),
        None => Box::new(StderrOutput::new()),
    };
    init_with(output, config.log_level)
}

/// Install the global logger with an explicit sink and threshold.
pub fn init_with(output: Box<dyn Output>, level: Level) -> Result<(), log::SetLoggerError> {
    let logger: &'static Logger = Box::leak(Box::new(Logger {
        level: AtomicU8::new(level as u8),
        output,
    }));
    log::set_logger(logger)?;
    log::set_max_level(level.to_filter());
    let _ = LOGGER.set(logger);
    Ok(())
}

/// Change the threshold at runtime. No-op before `init`.
pub fn set_level(level: Level) {
    if let Some(logger) = LOGGER.get() {
        logger.level.store(level as u8, Ordering::Relaxed);
        log::set_max_level(level.to_filter());
    }
}

/// Current threshold, or the default before `init`.
pub fn current_level() -> Level {
    match LOGGER.get() {
        Some(logger) => Level::from_u8(logger.level.load(Ordering::Relaxed)),
        None => Level::Error,
    }
}

/// Raise the threshold one step and return the new level.
pub fn bump_level() -> Level {
    let level = current_level().bump();
    set_level(level);
    level
}
