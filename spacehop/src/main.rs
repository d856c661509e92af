mod cli;
mod config;
mod directory;
mod error;
mod health;
mod ssh;
mod surface;
mod sync;
mod util;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::directory::gh::GhCli;
use crate::directory::{CreateParams, WorkspaceDirectory};
use crate::health::HealthMonitor;
use crate::ssh::config_file::SshConfigFile;
use crate::surface::{ConnectionSurface, SshSurface, TerminalPrompter};
use crate::sync::SyncEngine;
use crate::workspace::orchestrate::{Orchestrator, Outcome};
use crate::workspace::StateFilter;

#[derive(Parser)]
#[command(name = "spacehop", about = "Watch, drive and connect to GitHub Codespaces")]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the gh CLI, its authentication and the SSH paths. Exits 0 if all pass.
    Check,
    /// List workspaces grouped by repository.
    List {
        /// Case-insensitive match on name, display name, repository or branch.
        #[arg(long)]
        filter: Option<String>,
        /// all, running, stopped or transitional.
        #[arg(long, default_value = "all")]
        state: StateFilter,
        /// Print the grouped listing as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Keep the listing on screen and poll faster while workspaces transition.
    Watch {
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value = "all")]
        state: StateFilter,
    },
    /// Start a workspace and wait until it is available.
    Start { name: String },
    /// Stop a workspace and wait until it has shut down.
    Stop { name: String },
    /// Rebuild a workspace's container.
    Rebuild {
        name: String,
        /// Rebuild without the cached image.
        #[arg(long)]
        full: bool,
        /// Skip interactive confirmations.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Delete a workspace.
    Delete {
        name: String,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Create a workspace for a repository.
    Create {
        /// `owner/repo`.
        #[arg(long)]
        repo: String,
        #[arg(long, short)]
        branch: Option<String>,
        /// Machine type name, as listed by the repository.
        #[arg(long, short)]
        machine: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        idle_timeout: Option<u32>,
    },
    /// Start a workspace if needed, write its SSH entry and open a session.
    Connect {
        name: String,
        /// Do not probe the session while it is open.
        #[arg(long)]
        no_monitor: bool,
    },
    /// List stopped workspaces unused for longer than the threshold.
    Stale {
        /// Idle days before a workspace counts as stale (default from config).
        #[arg(long)]
        days: Option<u32>,
    },
    /// Show the alias in the managed SSH block.
    SshConfig {
        /// Remove the managed block.
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    let directory: Arc<dyn WorkspaceDirectory> = Arc::new(GhCli::new(&config.gh));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Check => {
            cli::run_check(&config, directory.as_ref()).await?;
        }
        Commands::List { filter, state, json } => {
            let engine = SyncEngine::new(directory, &config);
            apply_filter(&engine, filter, state).await;
            cli::run_list(&engine, json).await?;
        }
        Commands::Watch { filter, state } => {
            let engine = SyncEngine::new(directory, &config);
            apply_filter(&engine, filter, state).await;
            cli::run_watch(&engine).await?;
        }
        Commands::Start { name } => {
            let engine = SyncEngine::new(Arc::clone(&directory), &config);
            let orchestrator = orchestrator(directory, &config, false, Arc::new(SshSurface::new()))
                .with_sync(engine.clone());
            let outcome = orchestrator.start(&name, &cancel).await?;
            cli::print_after_change(&engine, outcome, Some(&name)).await;
        }
        Commands::Stop { name } => {
            let engine = SyncEngine::new(Arc::clone(&directory), &config);
            let orchestrator = orchestrator(directory, &config, false, Arc::new(SshSurface::new()))
                .with_sync(engine.clone());
            let outcome = orchestrator.stop(&name, &cancel).await?;
            cli::print_after_change(&engine, outcome, Some(&name)).await;
        }
        Commands::Rebuild { name, full, yes } => {
            let engine = SyncEngine::new(Arc::clone(&directory), &config);
            let orchestrator = orchestrator(directory, &config, yes, Arc::new(SshSurface::new()))
                .with_sync(engine.clone());
            let outcome = orchestrator.rebuild(&name, full, &cancel).await?;
            report(outcome, &name, "rebuilt");
            cli::print_after_change(&engine, outcome, Some(&name)).await;
        }
        Commands::Delete { name, yes } => {
            let engine = SyncEngine::new(Arc::clone(&directory), &config);
            let orchestrator = orchestrator(directory, &config, yes, Arc::new(SshSurface::new()))
                .with_sync(engine.clone());
            let outcome = orchestrator.delete(&name).await?;
            report(outcome, &name, "deleted");
            cli::print_after_change(&engine, outcome, None).await;
        }
        Commands::Create {
            repo,
            branch,
            machine,
            display_name,
            idle_timeout,
        } => {
            let engine = SyncEngine::new(Arc::clone(&directory), &config);
            let orchestrator = orchestrator(directory, &config, false, Arc::new(SshSurface::new()))
                .with_sync(engine.clone());
            let params = CreateParams {
                repository: repo,
                branch,
                machine,
                display_name,
                idle_timeout_minutes: idle_timeout,
            };
            let name = orchestrator.create(&params).await?;
            println!("{}", name);
            cli::print_after_change(&engine, Outcome::Completed, Some(&name)).await;
        }
        Commands::Connect { name, no_monitor } => {
            let surface = Arc::new(SshSurface::new());
            let orchestrator = orchestrator(Arc::clone(&directory), &config, false, surface.clone());
            let connection = orchestrator.connect(&name, &cancel).await?;
            println!(
                "Connecting to '{}' as {}{}",
                connection.workspace.display_name,
                connection.alias,
                if connection.verified { "" } else { " (unverified)" }
            );

            let monitor = (config.health.enabled && !no_monitor).then(|| {
                HealthMonitor::new(
                    directory,
                    Arc::new(TerminalPrompter::new(false)),
                    surface.clone(),
                    SshConfigFile::new(&config.ssh.config_path),
                    config.health.clone(),
                )
            });
            if let Some(monitor) = &monitor {
                monitor.watch(&name, &connection.alias).await?;
            }

            tokio::select! {
                status = surface.wait() => match status? {
                    Some(status) => tracing::debug!(%status, "ssh session exited"),
                    None if monitor.as_ref().is_some_and(|m| !m.is_watching()) => {
                        println!("Disconnected from '{}' after the connection was lost.", name);
                    }
                    None => {}
                },
                _ = cancel.cancelled() => {
                    orchestrator.disconnect(&connection.alias).await?;
                }
            }
            if let Some(monitor) = &monitor {
                monitor.stop();
            }
        }
        Commands::Stale { days } => {
            let threshold = days.unwrap_or(config.stale.threshold_days);
            let engine = SyncEngine::new(directory, &config);
            engine.refresh().await;
            if let Some(hint) = cli::readiness_hint(engine.snapshot().await.readiness) {
                anyhow::bail!("{}", hint);
            }
            let workspaces = engine.workspaces().await;
            let now = chrono::Utc::now();
            let stale = workspace::stale::find_stale(&workspaces, threshold, now);
            cli::print_stale(&stale, threshold, now);
        }
        Commands::SshConfig { clear } => {
            let orchestrator = orchestrator(directory, &config, false, Arc::new(SshSurface::new()));
            let path = orchestrator.ssh_file().path().display().to_string();
            if clear {
                orchestrator.clear_ssh_entry().await?;
                println!("Removed the managed block from {}", path);
            } else {
                match orchestrator.ssh_file().current_alias().await? {
                    Some(alias) => println!("{}: Host {}", path, alias),
                    None => println!("{}: no managed entry", path),
                }
            }
        }
    }

    Ok(())
}

fn orchestrator(
    directory: Arc<dyn WorkspaceDirectory>,
    config: &Config,
    assume_yes: bool,
    surface: Arc<dyn ConnectionSurface>,
) -> Orchestrator {
    Orchestrator::new(
        directory,
        Arc::new(TerminalPrompter::new(assume_yes)),
        surface,
        config,
    )
}

async fn apply_filter(engine: &SyncEngine, text: Option<String>, state: StateFilter) {
    if let Some(text) = text {
        engine.set_filter_text(text).await;
    }
    engine.set_filter_state(state).await;
}

fn report(outcome: Outcome, name: &str, verb: &str) {
    match outcome {
        Outcome::Completed => println!("'{}' {}.", name, verb),
        Outcome::Unchanged => {}
        Outcome::Declined => println!("Cancelled."),
    }
}
