//! Lifecycle orchestration: multi-step operations on one workspace, expressed
//! as commands to the directory followed by bounded poll-waits on remote state.
//!
//! The orchestrator never writes the sync cache. It asks the engine to refresh
//! and lets the next reload derive the truth.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Workspace, WorkspaceState};
use crate::config::{Config, LifecycleConfig, SshConfig};
use crate::directory::{CreateParams, WorkspaceDirectory};
use crate::error::{Result, SpaceError};
use crate::health::probe;
use crate::ssh::config_file::SshConfigFile;
use crate::ssh::{harden, parse_entries, select_entry};
use crate::surface::{ConnectionSurface, Prompter};
use crate::sync::SyncEngine;
use crate::util::expand_home;

/// Bounds for a poll-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.wait_timeout_secs),
            interval: Duration::from_secs(config.poll_interval_secs),
        }
    }
}

/// How a lifecycle operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Already in the requested state; nothing was issued.
    Unchanged,
    /// The user declined the confirmation.
    Declined,
}

/// Result of a successful connect.
#[derive(Debug, Clone)]
pub struct Connection {
    pub alias: String,
    pub workspace: Workspace,
    /// Whether a liveness probe succeeded before hand-off.
    pub verified: bool,
}

/// Decision taken by a poll-wait after each observation.
enum Check {
    Done,
    Continue,
    Abort(SpaceError),
}

pub struct Orchestrator {
    directory: Arc<dyn WorkspaceDirectory>,
    prompter: Arc<dyn Prompter>,
    surface: Arc<dyn ConnectionSurface>,
    ssh_file: SshConfigFile,
    /// Serializes read-modify-write of the SSH config file.
    merge_lock: Mutex<()>,
    lifecycle: LifecycleConfig,
    ssh: SshConfig,
    sync: Option<SyncEngine>,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<dyn WorkspaceDirectory>,
        prompter: Arc<dyn Prompter>,
        surface: Arc<dyn ConnectionSurface>,
        config: &Config,
    ) -> Self {
        Self {
            directory,
            prompter,
            surface,
            ssh_file: SshConfigFile::new(&config.ssh.config_path),
            merge_lock: Mutex::new(()),
            lifecycle: config.lifecycle.clone(),
            ssh: config.ssh.clone(),
            sync: None,
        }
    }

    /// Refresh `engine` after operations that change remote state.
    pub fn with_sync(mut self, engine: SyncEngine) -> Self {
        self.sync = Some(engine);
        self
    }

    pub fn ssh_file(&self) -> &SshConfigFile {
        &self.ssh_file
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::from_config(&self.lifecycle)
    }

    fn request_refresh(&self) {
        if let Some(sync) = &self.sync {
            sync.request_refresh();
        }
    }

    async fn fetch(&self, name: &str) -> Result<Workspace> {
        self.directory
            .get(name)
            .await?
            .ok_or_else(|| SpaceError::NotFound(name.to_string()))
    }

    /// Re-read `name` right after issuing a command so observers see the
    /// in-progress state without waiting for the next poll tick.
    async fn confirm_transition(&self, name: &str) {
        match self.directory.get(name).await {
            Ok(Some(ws)) if ws.state.is_transitional() => {
                debug!(workspace = name, state = %ws.state, "transition observed");
                self.request_refresh();
            }
            Ok(_) => {}
            Err(e) => debug!(workspace = name, error = %e, "confirmation re-read failed"),
        }
    }

    /// Poll `name` until `check` says done, the deadline passes, or `cancel` fires.
    async fn poll_until<F>(
        &self,
        name: &str,
        target: WorkspaceState,
        opts: WaitOptions,
        cancel: &CancellationToken,
        check: F,
    ) -> Result<Workspace>
    where
        F: Fn(&Workspace) -> Check,
    {
        let started = Instant::now();
        let deadline = started + opts.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(SpaceError::Cancelled);
            }
            let ws = self.fetch(name).await?;
            match check(&ws) {
                Check::Done => return Ok(ws),
                Check::Abort(e) => return Err(e),
                Check::Continue => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SpaceError::Timeout {
                    name: name.to_string(),
                    target,
                    waited: now - started,
                });
            }
            let nap = opts.interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(SpaceError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Block until `name` reaches `target`.
    ///
    /// Observing `Failed` aborts with `FailedState`; a workspace that disappears
    /// aborts with `NotFound`.
    pub async fn wait_for_state(
        &self,
        name: &str,
        target: WorkspaceState,
        opts: WaitOptions,
        cancel: &CancellationToken,
    ) -> Result<Workspace> {
        debug!(workspace = name, target = %target, timeout = ?opts.timeout, "waiting for state");
        self.poll_until(name, target, opts, cancel, |ws| {
            if ws.state == target {
                Check::Done
            } else if ws.state == WorkspaceState::Failed {
                Check::Abort(SpaceError::FailedState(ws.name.clone()))
            } else if ws.state.is_terminal() {
                Check::Abort(SpaceError::NotFound(ws.name.clone()))
            } else {
                Check::Continue
            }
        })
        .await
    }

    /// Make sure `name` is running, starting it if it is shut down.
    #[instrument(skip(self, cancel))]
    pub async fn ensure_available(&self, name: &str, cancel: &CancellationToken) -> Result<Workspace> {
        let ws = self.fetch(name).await?;
        match ws.state {
            WorkspaceState::Available => return Ok(ws),
            WorkspaceState::Failed => return Err(SpaceError::FailedState(name.to_string())),
            WorkspaceState::Shutdown => {
                info!(workspace = name, "starting workspace");
                self.directory.start(name).await?;
                self.confirm_transition(name).await;
            }
            other => debug!(workspace = name, state = %other, "waiting for in-flight transition"),
        }
        let ws = self
            .wait_for_state(name, WorkspaceState::Available, self.wait_options(), cancel)
            .await?;
        self.request_refresh();
        Ok(ws)
    }

    #[instrument(skip(self, cancel))]
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<Outcome> {
        let ws = self.fetch(name).await?;
        match ws.state {
            WorkspaceState::Available => {
                self.prompter
                    .notify(&format!("Workspace '{}' is already running.", ws.display_name))
                    .await;
                return Ok(Outcome::Unchanged);
            }
            WorkspaceState::Failed => return Err(SpaceError::FailedState(name.to_string())),
            WorkspaceState::Starting => {}
            _ => {
                self.directory.start(name).await?;
                self.confirm_transition(name).await;
            }
        }
        self.wait_for_state(name, WorkspaceState::Available, self.wait_options(), cancel)
            .await?;
        self.request_refresh();
        info!(workspace = name, "workspace started");
        Ok(Outcome::Completed)
    }

    #[instrument(skip(self, cancel))]
    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<Outcome> {
        let ws = self.fetch(name).await?;
        match ws.state {
            WorkspaceState::Shutdown => {
                self.prompter
                    .notify(&format!("Workspace '{}' is already stopped.", ws.display_name))
                    .await;
                return Ok(Outcome::Unchanged);
            }
            WorkspaceState::ShuttingDown => {}
            _ => {
                self.directory.stop(name).await?;
                self.confirm_transition(name).await;
            }
        }
        self.wait_for_state(name, WorkspaceState::Shutdown, self.wait_options(), cancel)
            .await?;
        self.request_refresh();
        info!(workspace = name, "workspace stopped");
        Ok(Outcome::Completed)
    }

    /// Issue a rebuild and return once the state has begun changing.
    ///
    /// Does not wait for the rebuild to finish. If no change is seen within the
    /// settle window the rebuild is still reported as accepted.
    #[instrument(skip(self, cancel))]
    pub async fn rebuild(&self, name: &str, full: bool, cancel: &CancellationToken) -> Result<Outcome> {
        let before = self.fetch(name).await?;
        let question = if full {
            format!(
                "Fully rebuild '{}'? The container image cache is discarded and everything outside /workspaces is lost.",
                before.display_name
            )
        } else {
            format!(
                "Rebuild '{}'? Everything outside /workspaces is lost.",
                before.display_name
            )
        };
        if !self.prompter.confirm(&question).await {
            return Ok(Outcome::Declined);
        }

        self.directory.rebuild(name, full).await?;
        info!(workspace = name, full, "rebuild requested");

        let settle = WaitOptions {
            timeout: Duration::from_secs(self.lifecycle.rebuild_settle_secs),
            interval: Duration::from_secs(self.lifecycle.poll_interval_secs)
                .min(Duration::from_secs(self.lifecycle.rebuild_settle_secs)),
        };
        let original = before.state;
        let settled = self
            .poll_until(name, WorkspaceState::Rebuilding, settle, cancel, |ws| {
                if ws.state.is_transitional() || ws.state != original {
                    Check::Done
                } else {
                    Check::Continue
                }
            })
            .await;
        match settled {
            Ok(ws) => debug!(workspace = name, state = %ws.state, "rebuild under way"),
            Err(SpaceError::Timeout { .. }) => {
                warn!(workspace = name, "rebuild accepted but no state change observed yet")
            }
            Err(e) => return Err(e),
        }
        self.request_refresh();
        Ok(Outcome::Completed)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<Outcome> {
        let ws = self.fetch(name).await?;
        let mut question = format!("Delete '{}'? This cannot be undone.", ws.display_name);
        if !ws.git_status.is_clean() {
            question.push_str(" It has uncommitted or unpushed changes.");
        }
        if !self.prompter.confirm(&question).await {
            return Ok(Outcome::Declined);
        }
        self.directory.delete(name).await?;
        info!(workspace = name, "workspace deleted");
        self.request_refresh();
        Ok(Outcome::Completed)
    }

    #[instrument(skip(self, params), fields(repository = %params.repository))]
    pub async fn create(&self, params: &CreateParams) -> Result<String> {
        let name = self.directory.create(params).await?;
        info!(workspace = %name, "workspace created");
        self.prompter
            .notify(&format!("Created workspace '{}'.", name))
            .await;
        self.request_refresh();
        Ok(name)
    }

    /// Bring `name` up, write its SSH entry, optionally verify the session and
    /// hand off to the connection surface.
    #[instrument(skip(self, cancel))]
    pub async fn connect(&self, name: &str, cancel: &CancellationToken) -> Result<Connection> {
        let ws = self.ensure_available(name, cancel).await?;

        let params = self.directory.fetch_connection_params(name).await?;
        let entry = select_entry(parse_entries(&params), name).ok_or_else(|| {
            SpaceError::parse("ssh connection parameters", "no Host entry found")
        })?;
        let entry = harden(entry, &self.ssh);

        if let Some(identity) = &entry.identity_file {
            self.ensure_identity(name, &expand_home(Path::new(identity))).await?;
        }

        {
            let _merge = self.merge_lock.lock().await;
            self.ssh_file.merge(Some(&entry)).await?;
        }

        let verified = if self.ssh.probe_before_handoff {
            let verified = self.probe_with_retries(name, cancel).await?;
            if !verified {
                self.prompter
                    .notify(&format!(
                        "Could not verify the connection to '{}'; continuing anyway.",
                        ws.display_name
                    ))
                    .await;
            }
            verified
        } else {
            false
        };

        self.surface.hand_off(&entry.alias, &ws).await?;
        info!(workspace = name, alias = %entry.alias, verified, "connection handed off");
        Ok(Connection {
            alias: entry.alias,
            workspace: ws,
            verified,
        })
    }

    /// The management tool provisions its key pair on first session use.
    async fn ensure_identity(&self, name: &str, identity: &Path) -> Result<()> {
        if tokio::fs::try_exists(identity).await? {
            return Ok(());
        }
        info!(workspace = name, identity = %identity.display(), "bootstrapping ssh identity");
        let timeout = Duration::from_secs(self.ssh.probe_timeout_secs);
        let output = self
            .directory
            .run_remote_command(name, &["true".to_string()], timeout)
            .await?;
        if !output.success() {
            debug!(workspace = name, stderr = %output.stderr.trim(), "bootstrap command failed");
        }
        if tokio::fs::try_exists(identity).await? {
            Ok(())
        } else {
            Err(SpaceError::command(
                "ssh identity bootstrap",
                format!("{} was not created", identity.display()),
            ))
        }
    }

    async fn probe_with_retries(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let timeout = Duration::from_secs(self.ssh.probe_timeout_secs);
        let delay = Duration::from_secs(self.ssh.probe_delay_secs);
        for attempt in 1..=self.ssh.probe_attempts {
            if probe(self.directory.as_ref(), name, timeout).await {
                return Ok(true);
            }
            debug!(workspace = name, attempt, "pre-handoff probe failed");
            if attempt < self.ssh.probe_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SpaceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Ok(false)
    }

    /// Tear down the session for `alias` if it is the one spacehop manages.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, alias: &str) -> Result<Outcome> {
        let managed = self.ssh_file.current_alias().await?;
        if managed.as_deref() != Some(alias) {
            self.prompter
                .notify(&format!("'{}' is not a connection managed by spacehop.", alias))
                .await;
            return Ok(Outcome::Unchanged);
        }
        self.surface.teardown(alias).await?;
        Ok(Outcome::Completed)
    }

    /// Remove the managed block from the SSH config.
    pub async fn clear_ssh_entry(&self) -> Result<()> {
        let _merge = self.merge_lock.lock().await;
        self.ssh_file.merge(None).await
    }
}
