//! Plugin stdio protocol.
//!
//! A plugin process handles exactly one command per launch:
//!
//! - `argv[1]`: handler name; missing or empty selects discovery mode, which
//!   prints one [`DiscoveryEntry`] per line and exits 0
//! - stdin: one JSON object of keyword arguments
//! - stdout: one JSON value (the result) on success
//! - stderr: a human-readable diagnostic on failure
//! - exit code: [`EXIT_OK`], [`E_COMMAND_NOT_DEFINED`] or [`E_RUNNING_COMMAND`]

use std::fmt;

pub const EXIT_OK: i32 = 0;

/// No handler is registered under the requested name.
pub const E_COMMAND_NOT_DEFINED: i32 = 252;

/// The handler (or its argument payload) failed.
pub const E_RUNNING_COMMAND: i32 = 253;

/// One line of discovery output: `name  [param, param]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub name: String,
    pub params: Vec<String>,
}

impl DiscoveryEntry {
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parse a line printed by a plugin in discovery mode.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let params = rest
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .map(|inner| {
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name: name.to_string(),
            params,
        })
    }
}

impl fmt::Display for DiscoveryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  [{}]", self.name, self.params.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let entry = DiscoveryEntry::new("script_run", &["script", "runas"]);
        assert_eq!(entry.to_string(), "script_run  [script, runas]");
        assert_eq!(DiscoveryEntry::new("ping", &[]).to_string(), "ping  []");
    }

    #[test]
    fn test_parse_display_output() {
        let entry = DiscoveryEntry::new("puppet_apply", &["recipe_code", "module_path", "debug"]);
        assert_eq!(DiscoveryEntry::parse(&entry.to_string()), Some(entry));
    }

    #[test]
    fn test_parse_bare_name_and_blank() {
        let entry = DiscoveryEntry::parse("ping").unwrap();
        assert_eq!(entry.name, "ping");
        assert!(entry.params.is_empty());
        assert_eq!(DiscoveryEntry::parse("   "), None);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_ne!(E_COMMAND_NOT_DEFINED, E_RUNNING_COMMAND);
        assert_ne!(E_COMMAND_NOT_DEFINED, EXIT_OK);
        assert_ne!(E_RUNNING_COMMAND, EXIT_OK);
    }
}
