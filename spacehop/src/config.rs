use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::expand_home;

/// Top-level configuration for spacehop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gh: GhConfig,
    pub sync: SyncConfig,
    pub lifecycle: LifecycleConfig,
    pub ssh: SshConfig,
    pub health: HealthConfig,
    pub stale: StaleConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.ssh.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load `explicit` if given, else the per-user config file if it exists,
    /// else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config_dir>/spacehop/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("spacehop").join("config.toml"))
    }

    /// Validate configuration values.
    pub(crate) fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.gh.binary.trim().is_empty(), "gh.binary must not be empty");
        anyhow::ensure!(
            self.gh.command_timeout_secs >= 1,
            "gh.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.gh.list_limit >= 1, "gh.list_limit must be >= 1");
        anyhow::ensure!(
            self.sync.fast_poll_interval_secs >= 1,
            "sync.fast_poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.sync.fast_poll_interval_secs < self.sync.background_poll_interval_secs,
            "sync.fast_poll_interval_secs ({}) must be less than sync.background_poll_interval_secs ({})",
            self.sync.fast_poll_interval_secs,
            self.sync.background_poll_interval_secs
        );
        anyhow::ensure!(
            self.lifecycle.poll_interval_secs >= 1,
            "lifecycle.poll_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.lifecycle.poll_interval_secs <= self.lifecycle.wait_timeout_secs,
            "lifecycle.poll_interval_secs ({}) must not exceed lifecycle.wait_timeout_secs ({})",
            self.lifecycle.poll_interval_secs,
            self.lifecycle.wait_timeout_secs
        );
        anyhow::ensure!(
            self.lifecycle.rebuild_settle_secs >= 1,
            "lifecycle.rebuild_settle_secs must be >= 1"
        );
        anyhow::ensure!(self.ssh.probe_attempts >= 1, "ssh.probe_attempts must be >= 1");
        anyhow::ensure!(self.ssh.probe_delay_secs >= 1, "ssh.probe_delay_secs must be >= 1");
        anyhow::ensure!(
            self.ssh.probe_timeout_secs >= 1,
            "ssh.probe_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.probe_interval_secs >= 1,
            "health.probe_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.probe_timeout_secs >= 1,
            "health.probe_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.failure_threshold >= 1,
            "health.failure_threshold must be >= 1"
        );
        anyhow::ensure!(self.stale.threshold_days >= 1, "stale.threshold_days must be >= 1");
        Ok(())
    }
}

/// How the GitHub CLI is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GhConfig {
    /// Executable name or path.
    pub binary: String,
    /// Upper bound for any single gh invocation.
    pub command_timeout_secs: u64,
    /// OAuth scope required for codespace operations.
    pub required_scope: String,
    /// `--limit` passed to `gh codespace list`.
    pub list_limit: u32,
}

impl Default for GhConfig {
    fn default() -> Self {
        Self {
            binary: "gh".into(),
            command_timeout_secs: 60,
            required_scope: "codespace".into(),
            list_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval while any workspace is transitional.
    pub fast_poll_interval_secs: u64,
    /// Interval while the surface is visible and nothing is transitional.
    pub background_poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fast_poll_interval_secs: 5,
            background_poll_interval_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.fast_poll_interval_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub wait_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// How long a rebuild waits to see the state begin changing.
    pub rebuild_settle_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 300,
            poll_interval_secs: 3,
            rebuild_settle_secs: 15,
        }
    }
}

/// SSH config file location and connection hardening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub config_path: PathBuf,
    pub identity_file: PathBuf,
    pub strict_host_key_checking: Option<String>,
    pub user_known_hosts_file: Option<String>,
    pub log_level: Option<String>,
    pub control_master: Option<String>,
    pub control_path: Option<String>,
    pub control_persist: Option<String>,
    /// Probe the session before handing off.
    pub probe_before_handoff: bool,
    pub probe_attempts: u32,
    pub probe_delay_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            config_path: expand_home(Path::new("~/.ssh/config")),
            identity_file: expand_home(Path::new("~/.ssh/codespaces.auto")),
            strict_host_key_checking: None,
            user_known_hosts_file: None,
            log_level: None,
            control_master: None,
            control_path: None,
            control_persist: None,
            probe_before_handoff: true,
            probe_attempts: 3,
            probe_delay_secs: 2,
            probe_timeout_secs: 15,
        }
    }
}

impl SshConfig {
    fn expand_paths(&mut self) {
        self.config_path = expand_home(&self.config_path);
        self.identity_file = expand_home(&self.identity_file);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before the connection is reported lost.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_secs: 30,
            probe_timeout_secs: 10,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleConfig {
    pub threshold_days: u32,
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self { threshold_days: 14 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.gh.binary, "gh");
        assert_eq!(config.gh.command_timeout_secs, 60);
        assert_eq!(config.gh.required_scope, "codespace");
        assert_eq!(config.sync.fast_poll_interval_secs, 5);
        assert_eq!(config.sync.background_poll_interval_secs, 60);
        assert_eq!(config.lifecycle.wait_timeout_secs, 300);
        assert_eq!(config.lifecycle.poll_interval_secs, 3);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.stale.threshold_days, 14);
        assert!(config.ssh.probe_before_handoff);
        assert!(config.ssh.config_path.ends_with(".ssh/config"));
        assert!(config.ssh.strict_host_key_checking.is_none());
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let (_dir, path) = write_config(
            r#"
[gh]
binary = "/opt/gh/bin/gh"

[sync]
fast_poll_interval_secs = 2

[ssh]
config_path = "~/custom/ssh_config"
strict_host_key_checking = "accept-new"
control_persist = "10m"

[health]
enabled = false
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gh.binary, "/opt/gh/bin/gh");
        assert_eq!(config.sync.fast_poll_interval_secs, 2);
        // Unset fields use defaults
        assert_eq!(config.sync.background_poll_interval_secs, 60);
        assert_eq!(config.gh.list_limit, 200);
        assert_eq!(config.ssh.strict_host_key_checking.as_deref(), Some("accept-new"));
        assert_eq!(config.ssh.control_persist.as_deref(), Some("10m"));
        assert!(!config.health.enabled);
        assert!(!config.ssh.config_path.starts_with("~"));
        assert!(config.ssh.config_path.ends_with("custom/ssh_config"));
    }

    #[test]
    fn config_load_rejects_invalid_values() {
        let (_dir, path) = write_config("[sync]\nfast_poll_interval_secs = 90\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("fast_poll_interval_secs"));
    }

    #[test]
    fn config_load_rejects_bad_toml() {
        let (_dir, path) = write_config("[gh\nbinary = ");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn config_resolve_explicit_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn config_validation_rejections() {
        let mut config = Config::default();
        config.health.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lifecycle.poll_interval_secs = 400;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gh.binary = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ssh.probe_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stale.threshold_days = 0;
        assert!(config.validate().is_err());
    }
}
