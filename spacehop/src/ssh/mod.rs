//! SSH connection entries: parsing `Host` blocks, validated formatting, hardening.
//!
//! Grammar accepted by [`parse_entries`]:
//!
//! ```text
//! file    := (blank | comment | host | option)*
//! host    := "Host" WS alias
//! option  := WS? key (WS | "=") value
//! comment := WS? "#" ...
//! ```
//!
//! Keys are case-insensitive. Options before the first `Host` line and unknown
//! keys are ignored.

pub mod config_file;

use std::sync::OnceLock;

use regex::Regex;

use crate::config::SshConfig;
use crate::error::{Result, SpaceError};

/// One `Host` block of an SSH client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshEntry {
    pub alias: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub proxy_command: Option<String>,
    pub identity_file: Option<String>,
    pub strict_host_key_checking: Option<String>,
    pub user_known_hosts_file: Option<String>,
    pub log_level: Option<String>,
    pub control_master: Option<String>,
    pub control_path: Option<String>,
    pub control_persist: Option<String>,
}

impl SshEntry {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Option fields in serialization order, paired with their directive names.
    fn options(&self) -> [(&'static str, &Option<String>); 10] {
        [
            ("HostName", &self.hostname),
            ("User", &self.user),
            ("ProxyCommand", &self.proxy_command),
            ("IdentityFile", &self.identity_file),
            ("StrictHostKeyChecking", &self.strict_host_key_checking),
            ("UserKnownHostsFile", &self.user_known_hosts_file),
            ("LogLevel", &self.log_level),
            ("ControlMaster", &self.control_master),
            ("ControlPath", &self.control_path),
            ("ControlPersist", &self.control_persist),
        ]
    }

    fn slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        let slot = match key.to_ascii_lowercase().as_str() {
            "hostname" => &mut self.hostname,
            "user" => &mut self.user,
            "proxycommand" => &mut self.proxy_command,
            "identityfile" => &mut self.identity_file,
            "stricthostkeychecking" => &mut self.strict_host_key_checking,
            "userknownhostsfile" => &mut self.user_known_hosts_file,
            "loglevel" => &mut self.log_level,
            "controlmaster" => &mut self.control_master,
            "controlpath" => &mut self.control_path,
            "controlpersist" => &mut self.control_persist,
            _ => return None,
        };
        Some(slot)
    }
}

/// Parse SSH configuration text into entries, in document order.
pub fn parse_entries(text: &str) -> Vec<SshEntry> {
    let mut entries: Vec<SshEntry> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = split_directive(line) else {
            continue;
        };
        if key.eq_ignore_ascii_case("host") {
            entries.push(SshEntry::new(value));
            continue;
        }
        if let Some(slot) = entries.last_mut().and_then(|e| e.slot(key)) {
            *slot = Some(value.to_string());
        }
    }
    entries
}

/// Split `Key value` or `Key=value` into its parts.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn control_chars() -> &'static Regex {
    static CONTROL_RE: OnceLock<Regex> = OnceLock::new();
    CONTROL_RE.get_or_init(|| Regex::new(r"[\p{Cc}\x{2028}\x{2029}]").expect("invalid control regex"))
}

fn check_value(field: &'static str, value: &str) -> Result<()> {
    if control_chars().is_match(value) {
        return Err(SpaceError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Serialize one entry, rejecting any value that contains a line break or
/// control character.
pub fn format_entry(entry: &SshEntry) -> Result<String> {
    if entry.alias.trim().is_empty() {
        return Err(SpaceError::InvalidValue {
            field: "Host",
            value: entry.alias.clone(),
        });
    }
    check_value("Host", &entry.alias)?;
    for (key, value) in entry.options() {
        if let Some(value) = value {
            check_value(key, value)?;
        }
    }

    let mut out = format!("Host {}\n", entry.alias);
    for (key, value) in entry.options() {
        if let Some(value) = value {
            out.push_str(&format!("    {} {}\n", key, value));
        }
    }
    Ok(out)
}

/// Fill unset hardening options and the identity file from configuration.
pub fn harden(mut entry: SshEntry, config: &SshConfig) -> SshEntry {
    let defaults = [
        (&mut entry.identity_file, Some(config.identity_file.to_string_lossy().to_string())),
        (&mut entry.strict_host_key_checking, config.strict_host_key_checking.clone()),
        (&mut entry.user_known_hosts_file, config.user_known_hosts_file.clone()),
        (&mut entry.log_level, config.log_level.clone()),
        (&mut entry.control_master, config.control_master.clone()),
        (&mut entry.control_path, config.control_path.clone()),
        (&mut entry.control_persist, config.control_persist.clone()),
    ];
    for (slot, default) in defaults {
        if slot.is_none() {
            *slot = default;
        }
    }
    entry
}

/// Pick the entry for `workspace`: the first alias containing its name, else the first.
pub fn select_entry(entries: Vec<SshEntry>, workspace: &str) -> Option<SshEntry> {
    let position = entries.iter().position(|e| e.alias.contains(workspace)).unwrap_or(0);
    entries.into_iter().nth(position)
}
