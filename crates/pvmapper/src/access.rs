// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allow/deny access control over PV names and client addresses.
//!
//! Two ordered rule lists are evaluated per request: PV rules against the
//! searched name (with any trailing `.FIELD` stripped first), then client
//! rules against the dotted-quad source address. Within each list the first
//! matching rule wins; a list with no matching rule defaults to allow. A
//! trailing deny-everything rule therefore turns the preceding allows into
//! a whitelist.

use regex::Regex;

/// Verdict of a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// One compiled rule with the config line it came from, kept for logging.
#[derive(Debug)]
pub struct Rule {
    action: Action,
    pattern: Regex,
    text: String,
}

impl Rule {
    /// Compile a rule. Patterns match the full subject, not a substring.
    fn new(action: Action, pattern: &str, text: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self {
            action,
            pattern,
            text: text.to_string(),
        })
    }

    fn matches(&self, subject: &str) -> bool {
        self.pattern.is_match(subject)
    }
}

/// Ordered PV and client rule lists.
#[derive(Debug, Default)]
pub struct AccessControl {
    pv_rules: Vec<Rule>,
    client_rules: Vec<Rule>,
}

impl AccessControl {
    /// Append a rule to the PV list.
    pub fn add_pv_rule(
        &mut self,
        action: Action,
        pattern: &str,
        text: &str,
    ) -> Result<(), regex::Error> {
        self.pv_rules.push(Rule::new(action, pattern, text)?);
        Ok(())
    }

    /// Append a rule to the client list.
    pub fn add_client_rule(
        &mut self,
        action: Action,
        pattern: &str,
        text: &str,
    ) -> Result<(), regex::Error> {
        self.client_rules.push(Rule::new(action, pattern, text)?);
        Ok(())
    }

    /// Evaluate a `(pv_name, client_ip)` request. On rejection returns the
    /// source text of the matching deny rule.
    pub fn check(&self, pv_name: &str, client_ip: &str) -> Result<(), &str> {
        let name = strip_field(pv_name);

        if let Some(rule) = first_match(&self.pv_rules, name) {
            if rule.action == Action::Deny {
                return Err(&rule.text);
            }
        }

        // CA only carries IPv4 addresses
        if let Some(rule) = first_match(&self.client_rules, client_ip) {
            if rule.action == Action::Deny {
                return Err(&rule.text);
            }
        }

        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.pv_rules.len() + self.client_rules.len()
    }
}

fn first_match<'a>(rules: &'a [Rule], subject: &str) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.matches(subject))
}

/// Strip the optional record field suffix: everything from the last `.` on.
pub fn strip_field(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) => &name[..pos],
        None => name,
    }
}
