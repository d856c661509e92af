//! Boundary to the remote workspace management tool.
//!
//! Everything the orchestrator, the sync engine and the health monitor know about
//! remote workspaces flows through [`WorkspaceDirectory`]. The production
//! implementation shells out to `gh` ([`gh::GhCli`]); tests use a scripted fake.

pub mod gh;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tracing::debug;

use crate::error::Result;
use crate::workspace::{MachineProfile, Workspace};

/// Outcome of the authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub has_required_scope: bool,
}

/// Per-item activity fetched separately from the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityRefinement {
    pub idle_timeout_minutes: Option<u32>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-item fields merged into a listed workspace. Unset means unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub machine: Option<MachineProfile>,
    pub activity: Option<ActivityRefinement>,
}

/// Parameters for creating a new workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateParams {
    /// `owner/repo`.
    pub repository: String,
    pub branch: Option<String>,
    pub machine: Option<String>,
    pub display_name: Option<String>,
    pub idle_timeout_minutes: Option<u32>,
}

/// Captured result of a command run inside a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait WorkspaceDirectory: Send + Sync {
    async fn check_installed(&self) -> bool;

    async fn check_auth(&self) -> Result<AuthStatus>;

    async fn list(&self) -> Result<Vec<Workspace>>;

    /// `Ok(None)` when the workspace no longer exists.
    async fn get(&self, name: &str) -> Result<Option<Workspace>>;

    async fn machine_profile(&self, name: &str) -> Result<Option<MachineProfile>>;

    async fn activity(&self, name: &str) -> Result<ActivityRefinement>;

    /// Machine profile plus, when `with_activity`, the activity refinement.
    ///
    /// Each half degrades to `None` on its own. Implementations that serve both
    /// from one record override this to fetch it once.
    async fn enrichment(&self, name: &str, with_activity: bool) -> Result<Enrichment> {
        let machine = match self.machine_profile(name).await {
            Ok(machine) => machine,
            Err(e) => {
                debug!(workspace = name, error = %e, "machine profile unavailable");
                None
            }
        };
        let activity = if with_activity {
            match self.activity(name).await {
                Ok(activity) => Some(activity),
                Err(e) => {
                    debug!(workspace = name, error = %e, "activity unavailable");
                    None
                }
            }
        } else {
            None
        };
        Ok(Enrichment { machine, activity })
    }

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn rebuild(&self, name: &str, full: bool) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Returns the name of the created workspace.
    async fn create(&self, params: &CreateParams) -> Result<String>;

    /// Raw SSH configuration text describing how to reach the workspace.
    async fn fetch_connection_params(&self, name: &str) -> Result<String>;

    async fn run_remote_command(
        &self,
        name: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<RemoteOutput>;
}
