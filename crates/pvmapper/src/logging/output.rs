// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Log output sinks: stderr and syslog(3).

use super::record_tag;
use std::ffi::CString;
use std::io::Write;

/// Destination for formatted log records.
pub trait Output: Send + Sync {
    fn write(&self, level: log::Level, message: &str);
}

/// Timestamped lines on stderr.
pub struct StderrOutput;

impl StderrOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StderrOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for StderrOutput {
    fn write(&self, level: log::Level, message: &str) {
        let now = chrono::Local::now();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{} {}: {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record_tag(level),
            message
        );
    }
}

/// syslog(3) daemon output.
///
/// `openlog` keeps the ident pointer, so the ident string is owned here and
/// the sink is expected to live for the rest of the process (the logger is
/// installed once and never torn down).
pub struct SyslogOutput {
    _ident: CString,
}

impl SyslogOutput {
    /// Open the syslog connection with the given ident and facility name.
    /// Unrecognized facility names fall back to LOCAL0.
    pub fn open(ident: &str, facility: &str) -> Self {
        let ident = to_cstring(ident);
        // SAFETY: ident stays alive for the lifetime of this sink, which is
        // installed into the process-wide logger and never dropped.
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_CONS, facility_from_name(facility));
        }
        Self { _ident: ident }
    }
}

impl Output for SyslogOutput {
    fn write(&self, level: log::Level, message: &str) {
        let message = to_cstring(message);
        // SAFETY: both pointers reference NUL-terminated buffers that outlive
        // the call; the format string takes exactly one %s argument.
        unsafe {
            libc::syslog(
                severity(level),
                c"%s".as_ptr(),
                message.as_ptr(),
            );
        }
    }
}

fn facility_from_name(name: &str) -> libc::c_int {
    match name {
        "LOCAL1" => libc::LOG_LOCAL1,
        "LOCAL2" => libc::LOG_LOCAL2,
        "LOCAL3" => libc::LOG_LOCAL3,
        "LOCAL4" => libc::LOG_LOCAL4,
        "LOCAL5" => libc::LOG_LOCAL5,
        "LOCAL6" => libc::LOG_LOCAL6,
        "LOCAL7" => libc::LOG_LOCAL7,
        "USER" => libc::LOG_USER,
        "SYSLOG" => libc::LOG_SYSLOG,
        "DAEMON" => libc::LOG_DAEMON,
        _ => libc::LOG_LOCAL0,
    }
}

fn severity(level: log::Level) -> libc::c_int {
    match level {
        log::Level::Error => libc::LOG_ERR,
        log::Level::Warn => libc::LOG_WARNING,
        log::Level::Info => libc::LOG_INFO,
        // operator "verbose" tier
        log::Level::Debug => libc::LOG_NOTICE,
        log::Level::Trace => libc::LOG_DEBUG,
    }
}

fn to_cstring(s: &str) -> CString {
    let cleaned: Vec<u8> = s.bytes().filter(|&b| b != 0).collect();
    // SAFETY: interior NUL bytes were filtered out above.
    unsafe { CString::from_vec_unchecked(cleaned) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_names() {
        assert_eq!(facility_from_name("LOCAL3"), libc::LOG_LOCAL3);
        assert_eq!(facility_from_name("DAEMON"), libc::LOG_DAEMON);
        // unknown names fall back to LOCAL0
        assert_eq!(facility_from_name("BOGUS"), libc::LOG_LOCAL0);
        assert_eq!(facility_from_name(""), libc::LOG_LOCAL0);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity(log::Level::Error), libc::LOG_ERR);
        assert_eq!(severity(log::Level::Info), libc::LOG_INFO);
        assert_eq!(severity(log::Level::Debug), libc::LOG_NOTICE);
        assert_eq!(severity(log::Level::Trace), libc::LOG_DEBUG);
    }

    #[test]
    fn test_nul_bytes_filtered() {
        let c = to_cstring("a\0b");
        assert_eq!(c.as_bytes(), b"ab");
    }
}
