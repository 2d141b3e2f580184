// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration file parsing.
//!
//! The format is line-oriented: one directive per line, key separated from
//! the value by `=` or whitespace, `#` starts a comment. Directive keys are
//! case-sensitive. A malformed line is reported on stderr and skipped;
//! parsing always continues so a single typo cannot take the service down.
//!
//! ```text
//! # allow only beamline 1 PVs, whitelist style
//! ALLOW_PV          BL01:.*
//! DENY_PV           .*
//! LOG_LEVEL         info
//! CA_LISTEN_ADDRESS 0.0.0.0:5053
//! CA_SEARCH_ADDRESS 192.168.1.255:5064
//! ```

use crate::access::{AccessControl, Action};
use crate::logging::Level;
use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default client-facing bind address.
pub const DEFAULT_LISTEN_PORT: u16 = 5053;
/// Default CA server port for upstream searches.
pub const DEFAULT_SEARCH_PORT: u16 = 5064;
/// Search backoff steps in seconds when none are configured.
pub const DEFAULT_SEARCH_INTERVALS: [u32; 6] = [1, 5, 10, 30, 60, 300];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid regular expression: {0}")]
    Pattern(#[from] regex::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Runtime configuration.
///
/// `heartbeat_interval` and `connect_timeout` have no file directive; they
/// are fixed operational parameters exposed as fields so tests can shorten
/// them.
#[derive(Debug)]
pub struct Config {
    pub access: AccessControl,
    pub log_level: Level,
    /// Syslog facility name; `None` logs to stderr.
    pub syslog_facility: Option<String>,
    pub syslog_ident: String,
    /// Age threshold and cadence of the cache purge.
    pub purge_delay: Duration,
    /// Search backoff steps in seconds.
    pub search_intervals: Vec<u32>,
    pub listen_addresses: Vec<SocketAddrV4>,
    pub search_addresses: Vec<SocketAddrV4>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access: AccessControl::default(),
            log_level: Level::Error,
            syslog_facility: None,
            syslog_ident: "PVmapper".to_string(),
            purge_delay: Duration::from_secs(600),
            search_intervals: DEFAULT_SEARCH_INTERVALS.to_vec(),
            listen_addresses: Vec::new(),
            search_addresses: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Parse a configuration file. Only an unreadable file is fatal;
    /// individual bad lines are reported on stderr and skipped.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_str_lossy(&text))
    }

    /// Parse configuration text, skipping bad lines with a stderr report.
    pub fn from_str_lossy(text: &str) -> Self {
        let mut config = Self {
            search_intervals: Vec::new(),
            ..Self::default()
        };

        for (index, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(err) = config.parse_line(line) {
                eprintln!("pvmapper: config line {}: {}: {}", index + 1, err, raw.trim());
            }
        }

        if config.listen_addresses.is_empty() {
            config
                .listen_addresses
                .push(SocketAddrV4::new([0, 0, 0, 0].into(), DEFAULT_LISTEN_PORT));
        }
        if config.search_intervals.is_empty() {
            config.search_intervals = DEFAULT_SEARCH_INTERVALS.to_vec();
        }
        config
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ConfigError> {
        let (key, value) = match line.split_once(['=', ' ', '\t']) {
            Some((key, rest)) => (key, rest.trim_start_matches(['=', ' ', '\t']).trim_end()),
            None => (line, ""),
        };

        match key {
            "ALLOW_PV" => self.access.add_pv_rule(Action::Allow, required(value)?, line)?,
            "DENY_PV" => self.access.add_pv_rule(Action::Deny, required(value)?, line)?,
            "ALLOW_CLIENT" => self
                .access
                .add_client_rule(Action::Allow, required(value)?, line)?,
            "DENY_CLIENT" => self
                .access
                .add_client_rule(Action::Deny, required(value)?, line)?,
            "LOG_LEVEL" => {
                self.log_level = Level::parse(required(value)?).ok_or_else(|| {
                    ConfigError::Invalid(format!("invalid LOG_LEVEL value '{}'", value))
                })?;
            }
            "SYSLOG_FACILITY" => self.syslog_facility = Some(required(value)?.to_string()),
            "SYSLOG_ID" => self.syslog_ident = required(value)?.to_string(),
            "PURGE_DELAY" => {
                self.purge_delay = Duration::from_secs(positive_int(value, "PURGE_DELAY")?);
            }
            "SEARCH_INTERVAL" => {
                let mut intervals = Vec::new();
                for word in required(value)?.split_whitespace() {
                    intervals.push(positive_int(word, "SEARCH_INTERVAL")? as u32);
                }
                self.search_intervals.extend(intervals);
            }
            "CA_LISTEN_ADDRESS" => {
                let addr = parse_address(required(value)?, DEFAULT_LISTEN_PORT)?;
                self.listen_addresses.push(addr);
            }
            "CA_SEARCH_ADDRESS" => {
                let addr = parse_address(required(value)?, DEFAULT_SEARCH_PORT)?;
                self.search_addresses.push(addr);
            }
            _ => {
                return Err(ConfigError::Invalid(format!("unknown directive '{}'", key)));
            }
        }
        Ok(())
    }
}

fn required(value: &str) -> Result<&str, ConfigError> {
    if value.is_empty() {
        Err(ConfigError::Invalid("missing value".to_string()))
    } else {
        Ok(value)
    }
}

fn positive_int(value: &str, directive: &str) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid(format!(
            "invalid {} value '{}'",
            directive, value
        ))),
    }
}

/// Parse `ip[:port]`, applying `default_port` when the port is absent.
fn parse_address(value: &str, default_port: u16) -> Result<SocketAddrV4, ConfigError> {
    let (ip, port) = match value.rsplit_once(':') {
        Some((ip, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid port '{}'", port)))?;
            if port == 0 {
                return Err(ConfigError::Invalid("port must be non-zero".to_string()));
            }
            (ip, port)
        }
        None => (value, default_port),
    };
    let ip = ip
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid IPv4 address '{}'", ip)))?;
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::from_str_lossy("");
        assert_eq!(config.log_level, Level::Error);
        assert_eq!(config.syslog_facility, None);
        assert_eq!(config.syslog_ident, "PVmapper");
        assert_eq!(config.purge_delay, Duration::from_secs(600));
        assert_eq!(config.search_intervals, DEFAULT_SEARCH_INTERVALS);
        assert_eq!(config.listen_addresses, vec!["0.0.0.0:5053".parse().unwrap()]);
        assert!(config.search_addresses.is_empty());
    }

    #[test]
    fn test_full_file() {
        let text = "\
# beamline resolver
ALLOW_PV          BL01:.*   # whitelist
DENY_PV           .*
ALLOW_CLIENT      10\\.0\\..*
LOG_LEVEL = verbose
SYSLOG_FACILITY   LOCAL3
SYSLOG_ID         bl01-mapper
PURGE_DELAY       120
SEARCH_INTERVAL   1 3 7
SEARCH_INTERVAL   30
CA_LISTEN_ADDRESS 127.0.0.1:15053
CA_SEARCH_ADDRESS 192.168.1.255
";
        let config = Config::from_str_lossy(text);
        assert_eq!(config.access.rule_count(), 3);
        assert_eq!(config.log_level, Level::Verbose);
        assert_eq!(config.syslog_facility.as_deref(), Some("LOCAL3"));
        assert_eq!(config.syslog_ident, "bl01-mapper");
        assert_eq!(config.purge_delay, Duration::from_secs(120));
        assert_eq!(config.search_intervals, vec![1, 3, 7, 30]);
        assert_eq!(
            config.listen_addresses,
            vec!["127.0.0.1:15053".parse().unwrap()]
        );
        // port defaults to the CA server port when absent
        assert_eq!(
            config.search_addresses,
            vec!["192.168.1.255:5064".parse().unwrap()]
        );
    }

    #[test]
    fn test_bad_lines_are_skipped_not_fatal() {
        let text = "\
LOG_LEVEL loud
PURGE_DELAY -5
PURGE_DELAY 0
ALLOW_PV [broken
CA_LISTEN_ADDRESS 300.1.2.3:5053
CA_SEARCH_ADDRESS 10.0.0.255:notaport
NO_SUCH_KEY value
LOG_LEVEL info
";
        let config = Config::from_str_lossy(text);
        assert_eq!(config.log_level, Level::Info);
        assert_eq!(config.purge_delay, Duration::from_secs(600));
        assert_eq!(config.access.rule_count(), 0);
        assert!(config.search_addresses.is_empty());
        // the bad listen line is skipped, so the default bind applies
        assert_eq!(config.listen_addresses, vec!["0.0.0.0:5053".parse().unwrap()]);
    }

    #[test]
    fn test_separator_variants() {
        for line in ["LOG_LEVEL=debug", "LOG_LEVEL debug", "LOG_LEVEL \t = debug"] {
            let config = Config::from_str_lossy(line);
            assert_eq!(config.log_level, Level::Debug, "line: {:?}", line);
        }
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let config = Config::from_str_lossy("log_level debug");
        assert_eq!(config.log_level, Level::Error);
    }

    #[test]
    fn test_multiple_listen_addresses() {
        let text = "CA_LISTEN_ADDRESS 127.0.0.1:15053\nCA_LISTEN_ADDRESS 127.0.0.1:15054\n";
        let config = Config::from_str_lossy(text);
        assert_eq!(config.listen_addresses.len(), 2);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "LOG_LEVEL info").unwrap();
        writeln!(file, "CA_SEARCH_ADDRESS 127.0.0.1:15064").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.log_level, Level::Info);
        assert_eq!(config.search_addresses.len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file(Path::new("/nonexistent/pvmapper.conf")).is_err());
    }
}
