//! User-facing seams: prompts and the external interactive session.

use std::io::Write;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::workspace::Workspace;

/// Answer to the "connection appears lost" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostChoice {
    Reconnect,
    Disconnect,
}

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask a yes/no question. `false` means declined.
    async fn confirm(&self, message: &str) -> bool;

    async fn notify(&self, message: &str);

    async fn connection_lost(&self, workspace: &str) -> LostChoice;
}

/// Where an established connection is handed to the user.
#[async_trait]
pub trait ConnectionSurface: Send + Sync {
    async fn hand_off(&self, alias: &str, workspace: &Workspace) -> Result<()>;

    async fn teardown(&self, alias: &str) -> Result<()>;
}

/// Prompts on stdin/stdout.
pub struct TerminalPrompter {
    assume_yes: bool,
}

impl TerminalPrompter {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }

    /// Read one answer from the controlling terminal, else from stdin.
    async fn ask(&self, question: &str) -> String {
        print!("{} ", question);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let read = match tokio::fs::File::open("/dev/tty").await {
            Ok(tty) => BufReader::new(tty).read_line(&mut line).await,
            Err(_) => BufReader::new(tokio::io::stdin()).read_line(&mut line).await,
        };
        if let Err(e) = read {
            debug!(error = %e, "failed to read answer");
        }
        line.trim().to_lowercase()
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        matches!(self.ask(&format!("{} [y/N]", message)).await.as_str(), "y" | "yes")
    }

    async fn notify(&self, message: &str) {
        println!("{}", message);
    }

    /// The `ssh` child still shares the terminal here, so keystrokes can reach
    /// either reader. Anything other than an explicit `d` keeps the session,
    /// so a partly swallowed answer never tears it down.
    async fn connection_lost(&self, workspace: &str) -> LostChoice {
        let answer = self
            .ask(&format!(
                "Connection to '{}' appears lost. [r]econnect or [d]isconnect?",
                workspace
            ))
            .await;
        lost_choice(&answer)
    }
}

fn lost_choice(answer: &str) -> LostChoice {
    match answer.trim() {
        "d" | "disconnect" => LostChoice::Disconnect,
        _ => LostChoice::Reconnect,
    }
}

struct Session {
    alias: String,
    child: Option<Child>,
    stop: CancellationToken,
}

/// Hands off by running `ssh <alias>` with the terminal attached.
pub struct SshSurface {
    binary: String,
    session: Mutex<Option<Session>>,
}

impl SshSurface {
    pub fn new() -> Self {
        Self {
            binary: "ssh".into(),
            session: Mutex::new(None),
        }
    }

    /// Wait for the current session to end, either on its own or via teardown.
    ///
    /// Returns `None` when there is no session or it was torn down.
    pub async fn wait(&self) -> Result<Option<ExitStatus>> {
        let (mut child, stop) = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) => match session.child.take() {
                    Some(child) => (child, session.stop.clone()),
                    None => return Ok(None),
                },
                None => return Ok(None),
            }
        };

        tokio::select! {
            status = child.wait() => Ok(Some(status?)),
            _ = stop.cancelled() => {
                child.kill().await?;
                Ok(None)
            }
        }
    }
}

impl Default for SshSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionSurface for SshSurface {
    async fn hand_off(&self, alias: &str, workspace: &Workspace) -> Result<()> {
        let child = Command::new(&self.binary)
            .arg(alias)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        info!(alias, workspace = %workspace.name, "ssh session started");

        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.take() {
            previous.stop.cancel();
        }
        *guard = Some(Session {
            alias: alias.to_string(),
            child: Some(child),
            stop: CancellationToken::new(),
        });
        Ok(())
    }

    async fn teardown(&self, alias: &str) -> Result<()> {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) if session.alias == alias => {
                session.stop.cancel();
                if let Some(child) = session.child.as_mut() {
                    child.start_kill()?;
                }
                info!(alias, "ssh session torn down");
            }
            _ => debug!(alias, "no matching ssh session to tear down"),
        }
        Ok(())
    }
}
