//! Connection health monitor.
//!
//! Periodically runs a trivial remote command over the workspace's session
//! channel. After `failure_threshold` consecutive failures the user decides
//! whether to reconnect or disconnect; the monitor never keeps probing a lost
//! connection on its own.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::directory::WorkspaceDirectory;
use crate::error::Result;
use crate::ssh::config_file::SshConfigFile;
use crate::surface::{ConnectionSurface, LostChoice, Prompter};

/// Marker echoed back by a healthy session.
pub const PROBE_TOKEN: &str = "spacehop-health";

/// Result of recording one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Degraded { failures: u32 },
    Lost,
}

/// Consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    consecutive_failures: u32,
    threshold: u32,
}

impl ConnectionHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record(&mut self, ok: bool) -> HealthVerdict {
        if ok {
            self.consecutive_failures = 0;
            return HealthVerdict::Healthy;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            HealthVerdict::Lost
        } else {
            HealthVerdict::Degraded {
                failures: self.consecutive_failures,
            }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Run the probe command once. Any error, timeout or unexpected output is a failure.
pub async fn probe(directory: &dyn WorkspaceDirectory, workspace: &str, timeout: Duration) -> bool {
    let argv = vec!["echo".to_string(), PROBE_TOKEN.to_string()];
    match tokio::time::timeout(timeout, directory.run_remote_command(workspace, &argv, timeout)).await {
        Ok(Ok(output)) => output.success() && output.stdout.trim() == PROBE_TOKEN,
        Ok(Err(e)) => {
            debug!(workspace, error = %e, "health probe failed");
            false
        }
        Err(_) => {
            debug!(workspace, "health probe timed out");
            false
        }
    }
}

struct Watch {
    workspace: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    directory: Arc<dyn WorkspaceDirectory>,
    prompter: Arc<dyn Prompter>,
    surface: Arc<dyn ConnectionSurface>,
    ssh_file: SshConfigFile,
    config: HealthConfig,
    current: Mutex<Option<Watch>>,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<dyn WorkspaceDirectory>,
        prompter: Arc<dyn Prompter>,
        surface: Arc<dyn ConnectionSurface>,
        ssh_file: SshConfigFile,
        config: HealthConfig,
    ) -> Self {
        Self {
            directory,
            prompter,
            surface,
            ssh_file,
            config,
            current: Mutex::new(None),
        }
    }

    /// Start probing `workspace`, replacing any previous watch.
    ///
    /// Returns `false` without starting when `alias` is not the one in the
    /// managed block, i.e. the session was not established by spacehop.
    pub async fn watch(&self, workspace: &str, alias: &str) -> Result<bool> {
        let managed = self.ssh_file.current_alias().await?;
        if managed.as_deref() != Some(alias) {
            warn!(workspace, alias, managed = ?managed, "not monitoring unmanaged session");
            return Ok(false);
        }

        self.stop();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.directory),
            Arc::clone(&self.prompter),
            Arc::clone(&self.surface),
            self.config.clone(),
            workspace.to_string(),
            alias.to_string(),
            token.clone(),
        ));
        info!(
            workspace,
            alias,
            interval_secs = self.config.probe_interval_secs,
            "health monitor started"
        );
        *self.lock() = Some(Watch {
            workspace: workspace.to_string(),
            token,
            handle,
        });
        Ok(true)
    }

    pub fn stop(&self) {
        if let Some(watch) = self.lock().take() {
            watch.token.cancel();
            debug!(workspace = %watch.workspace, "health monitor stopped");
        }
    }

    /// Whether a watch is active and its loop still running.
    pub fn is_watching(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Watch>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    directory: Arc<dyn WorkspaceDirectory>,
    prompter: Arc<dyn Prompter>,
    surface: Arc<dyn ConnectionSurface>,
    config: HealthConfig,
    workspace: String,
    alias: String,
    token: CancellationToken,
) {
    let interval = Duration::from_secs(config.probe_interval_secs);
    let timeout = Duration::from_secs(config.probe_timeout_secs);
    let mut health = ConnectionHealth::new(config.failure_threshold);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let ok = probe(directory.as_ref(), &workspace, timeout).await;
        match health.record(ok) {
            HealthVerdict::Healthy => debug!(workspace = %workspace, "connection healthy"),
            HealthVerdict::Degraded { failures } => {
                warn!(workspace = %workspace, failures, "health probe failed")
            }
            HealthVerdict::Lost => {
                warn!(
                    workspace = %workspace,
                    failures = health.failures(),
                    "connection appears lost"
                );
                if token.is_cancelled() {
                    return;
                }
                match prompter.connection_lost(&workspace).await {
                    LostChoice::Reconnect => {
                        info!(workspace = %workspace, "resuming health checks");
                        health.reset();
                    }
                    LostChoice::Disconnect => {
                        if let Err(e) = surface.teardown(&alias).await {
                            warn!(alias = %alias, error = %e, "teardown failed");
                        }
                        return;
                    }
                }
            }
        }
    }
}
