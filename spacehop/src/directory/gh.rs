use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use spacehop_protocol::{decode_details, decode_list, decode_record, CodespaceDetails, DETAILS_PATH_PREFIX, LIST_FIELDS};

use super::{ActivityRefinement, AuthStatus, CreateParams, Enrichment, RemoteOutput, WorkspaceDirectory};
use crate::config::GhConfig;
use crate::error::{Result, SpaceError};
use crate::util::shell_join;
use crate::workspace::{parse_timestamp, MachineProfile, Workspace};

/// Creation blocks until the codespace is provisioned, which regularly outlasts
/// the normal command timeout.
const CREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Workspace directory backed by the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhCli {
    binary: String,
    command_timeout: Duration,
    required_scope: String,
    list_limit: u32,
}

/// Raw result of one `gh` invocation.
struct GhOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl GhOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl GhCli {
    pub fn new(config: &GhConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            required_scope: config.required_scope.clone(),
            list_limit: config.list_limit,
        }
    }

    /// Run `gh` with the given arguments, bounded by `timeout`.
    ///
    /// A non-zero exit is not an error here; see [`GhCli::run_checked`].
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<GhOutput> {
        debug!(args = ?args, "running gh command");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpaceError::NotInstalled)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(SpaceError::command(
                    describe(args),
                    format!("timed out after {}s", timeout.as_secs()),
                ))
            }
        };

        Ok(GhOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run `gh` and return stdout, classifying any failure.
    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args, self.command_timeout).await?;
        if !output.success() {
            return Err(classify_failure(&describe(args), &output.stderr, &self.required_scope));
        }
        Ok(output.stdout)
    }

    async fn details(&self, name: &str) -> Result<CodespaceDetails> {
        let path = format!("{}/{}", DETAILS_PATH_PREFIX, name);
        let stdout = self.run_checked(&["api", &path]).await?;
        decode_details(&stdout).map_err(|e| SpaceError::parse(format!("details for {}", name), e))
    }
}

#[async_trait]
impl WorkspaceDirectory for GhCli {
    async fn check_installed(&self) -> bool {
        match self.run(&["--version"], self.command_timeout).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(error = %e, "gh --version failed");
                false
            }
        }
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        let output = self.run(&["auth", "status"], self.command_timeout).await?;
        if !output.success() {
            return Ok(AuthStatus {
                authenticated: false,
                has_required_scope: false,
            });
        }
        // Older gh versions print the status report on stderr.
        let report = format!("{}\n{}", output.stdout, output.stderr);
        let has_required_scope = match parse_token_scopes(&report) {
            Some(scopes) => scopes.iter().any(|s| s == &self.required_scope),
            None => true,
        };
        Ok(AuthStatus {
            authenticated: true,
            has_required_scope,
        })
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Workspace>> {
        let limit = self.list_limit.to_string();
        let stdout = self
            .run_checked(&["codespace", "list", "--json", LIST_FIELDS, "--limit", &limit])
            .await?;
        let records = decode_list(&stdout).map_err(|e| SpaceError::parse("codespace list", e))?;
        Ok(records.into_iter().map(Workspace::from_record).collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Workspace>> {
        let args = ["codespace", "view", "--codespace", name, "--json", LIST_FIELDS];
        let output = self.run(&args, self.command_timeout).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(classify_failure(&describe(&args), &output.stderr, &self.required_scope));
        }
        let record = decode_record(&output.stdout)
            .map_err(|e| SpaceError::parse(format!("codespace view {}", name), e))?;
        Ok(Some(Workspace::from_record(record)))
    }

    async fn machine_profile(&self, name: &str) -> Result<Option<MachineProfile>> {
        Ok(self.details(name).await?.machine.map(MachineProfile::from))
    }

    async fn activity(&self, name: &str) -> Result<ActivityRefinement> {
        Ok(activity_of(&self.details(name).await?))
    }

    /// One detail request serves both halves.
    async fn enrichment(&self, name: &str, with_activity: bool) -> Result<Enrichment> {
        let details = self.details(name).await?;
        Ok(Enrichment {
            activity: with_activity.then(|| activity_of(&details)),
            machine: details.machine.map(MachineProfile::from),
        })
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<()> {
        let path = format!("{}/{}/start", DETAILS_PATH_PREFIX, name);
        self.run_checked(&["api", "--method", "POST", &path]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<()> {
        self.run_checked(&["codespace", "stop", "--codespace", name]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rebuild(&self, name: &str, full: bool) -> Result<()> {
        let mut args = vec!["codespace", "rebuild", "--codespace", name];
        if full {
            args.push("--full");
        }
        self.run_checked(&args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<()> {
        self.run_checked(&["codespace", "delete", "--codespace", name, "--force"])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, params), fields(repository = %params.repository))]
    async fn create(&self, params: &CreateParams) -> Result<String> {
        let owned = create_args(params);
        let args: Vec<&str> = owned.iter().map(String::as_str).collect();
        let output = self.run(&args, self.command_timeout.max(CREATE_TIMEOUT)).await?;
        if !output.success() {
            return Err(classify_failure("gh codespace create", &output.stderr, &self.required_scope));
        }
        last_nonempty_line(&output.stdout)
            .map(str::to_string)
            .ok_or_else(|| SpaceError::parse("codespace create output", "no codespace name printed"))
    }

    async fn fetch_connection_params(&self, name: &str) -> Result<String> {
        self.run_checked(&["codespace", "ssh", "--codespace", name, "--config"])
            .await
    }

    async fn run_remote_command(
        &self,
        name: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        let remote = shell_join(argv);
        let args = ["codespace", "ssh", "--codespace", name, "--", remote.as_str()];
        let output = self.run(&args, timeout).await?;
        if !output.success() {
            let err = classify_failure(&describe(&args), &output.stderr, &self.required_scope);
            if err.is_readiness() {
                return Err(err);
            }
            warn!(workspace = %name, exit_code = output.exit_code, "remote command exited non-zero");
        }
        Ok(RemoteOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn activity_of(details: &CodespaceDetails) -> ActivityRefinement {
    ActivityRefinement {
        idle_timeout_minutes: details.idle_timeout_minutes,
        last_used_at: details.last_used_at.as_deref().and_then(parse_timestamp),
    }
}

fn describe(args: &[&str]) -> String {
    let head: Vec<&str> = args.iter().take(2).copied().collect();
    format!("gh {}", head.join(" "))
}

/// Map a failed invocation's stderr onto the error taxonomy.
pub(crate) fn classify_failure(command: &str, stderr: &str, required_scope: &str) -> SpaceError {
    let lower = stderr.to_lowercase();
    if lower.contains("gh auth login") || lower.contains("not logged in") {
        return SpaceError::NotAuthenticated;
    }
    let scope_hint = format!("-s {}", required_scope.to_lowercase());
    if lower.contains(&scope_hint)
        || (lower.contains("scope") && lower.contains(&required_scope.to_lowercase()))
    {
        return SpaceError::ScopeRequired {
            scope: required_scope.to_string(),
        };
    }
    SpaceError::command(command, stderr.trim())
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found") || lower.contains("404") || lower.contains("no codespace")
}

/// Extract the token scopes from `gh auth status` output.
///
/// Returns `None` when the report has no scopes line (fine-grained tokens).
pub(crate) fn parse_token_scopes(report: &str) -> Option<Vec<String>> {
    let line = report.lines().find(|l| l.contains("Token scopes:"))?;
    let (_, list) = line.split_once("Token scopes:")?;
    Some(
        list.split(',')
            .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
            .filter(|s| !s.is_empty() && s != "none")
            .collect(),
    )
}

pub(crate) fn create_args(params: &CreateParams) -> Vec<String> {
    let mut args = vec![
        "codespace".to_string(),
        "create".to_string(),
        "--repo".to_string(),
        params.repository.clone(),
    ];
    let optional = [
        ("--branch", params.branch.clone()),
        ("--machine", params.machine.clone()),
        ("--display-name", params.display_name.clone()),
        ("--idle-timeout", params.idle_timeout_minutes.map(|m| format!("{}m", m))),
    ];
    for (flag, value) in optional {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value);
        }
    }
    args
}

fn last_nonempty_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}
