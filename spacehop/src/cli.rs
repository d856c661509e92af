use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::directory::WorkspaceDirectory;
use crate::sync::{PollMode, Readiness, SyncEngine, SyncEvent, SyncSnapshot};
use crate::workspace::orchestrate::Outcome;
use crate::workspace::stale::idle_days;
use crate::workspace::{VersionControlStatus, Workspace, WorkspaceState};

/// A single prerequisite check result.
struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `spacehop check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config, directory: &dyn WorkspaceDirectory) -> Result<()> {
    println!("Checking prerequisites...\n");

    let mut checks: Vec<Check> = Vec::new();

    let installed = directory.check_installed().await;
    checks.push(if installed {
        Check::pass("gh CLI", format!("'{}' found", config.gh.binary))
    } else {
        Check::fail(
            "gh CLI",
            format!("'{}' not found", config.gh.binary),
            "install the GitHub CLI: https://cli.github.com",
        )
    });

    if installed {
        match directory.check_auth().await {
            Ok(status) if !status.authenticated => checks.push(Check::fail(
                "gh authentication",
                "not logged in",
                "gh auth login",
            )),
            Ok(status) => {
                checks.push(Check::pass("gh authentication", "logged in"));
                checks.push(if status.has_required_scope {
                    Check::pass("token scope", format!("'{}' granted", config.gh.required_scope))
                } else {
                    Check::fail(
                        "token scope",
                        format!("'{}' missing", config.gh.required_scope),
                        format!("gh auth refresh -h github.com -s {}", config.gh.required_scope),
                    )
                });
            }
            Err(e) => checks.push(Check::fail("gh authentication", e.to_string(), "gh auth status")),
        }
    }

    checks.push(check_ssh_dir(&config.ssh.config_path));

    checks.push(if config.ssh.identity_file.exists() {
        Check::pass("ssh identity", config.ssh.identity_file.display().to_string())
    } else {
        // gh creates it on first connect; not fatal.
        Check::pass(
            "ssh identity",
            format!("{} (created on first connect)", config.ssh.identity_file.display()),
        )
    });

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: spacehop list");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_ssh_dir(config_path: &Path) -> Check {
    let Some(parent) = config_path.parent() else {
        return Check::fail("ssh config", config_path.display().to_string(), "set ssh.config_path to a file path");
    };
    match std::fs::metadata(parent) {
        Ok(meta) if meta.permissions().readonly() => Check::fail(
            "ssh config",
            format!("{} is read-only", parent.display()),
            format!("chmod u+w {}", parent.display()),
        ),
        Ok(_) => Check::pass("ssh config", config_path.display().to_string()),
        Err(_) => Check::pass(
            "ssh config",
            format!("{} (directory created on first connect)", config_path.display()),
        ),
    }
}

/// Refresh once and print the grouped listing, as a table or as JSON.
pub async fn run_list(engine: &SyncEngine, json: bool) -> Result<()> {
    engine.refresh().await;
    let snapshot = engine.snapshot().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.groups)?);
    } else {
        print!("{}", render_snapshot(&snapshot, Utc::now()));
    }
    match readiness_hint(snapshot.readiness) {
        Some(hint) => anyhow::bail!("{}", hint),
        None => Ok(()),
    }
}

/// Keep the listing on screen, redrawing on every change, until interrupted.
pub async fn run_watch(engine: &SyncEngine) -> Result<()> {
    let mut events = engine.subscribe();
    engine.start().await;
    print!("{}", render_snapshot(&engine.snapshot().await, Utc::now()));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::Refreshed { .. }) | Ok(SyncEvent::Failed(_)) | Ok(SyncEvent::ViewChanged) => {
                    println!();
                    print!("{}", render_snapshot(&engine.snapshot().await, Utc::now()));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "watch lagged behind sync events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    engine.dispose();
    Ok(())
}

/// Show the listing once the refresh requested by a lifecycle operation lands.
///
/// Call right after the operation returns. Only a reload that starts after
/// that point counts, so one already in flight with older data is skipped.
/// `name` narrows the listing to the affected workspace. When nothing changed,
/// or no reload arrives in time, refresh directly.
pub async fn print_after_change(engine: &SyncEngine, outcome: Outcome, name: Option<&str>) {
    let mut events = engine.subscribe();
    if let Some(name) = name {
        engine.set_filter_text(name).await;
    }
    let landed = outcome == Outcome::Completed
        && tokio::time::timeout(REFRESH_WAIT, next_reload(&mut events))
            .await
            .unwrap_or(false);
    if !landed {
        engine.refresh().await;
    }
    engine.dispose();
    print!("{}", render_snapshot(&engine.snapshot().await, Utc::now()));
}

/// Wait for a reload that begins and ends on this receiver.
async fn next_reload(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> bool {
    let mut started = false;
    loop {
        match events.recv().await {
            Ok(SyncEvent::Loading) => started = true,
            Ok(SyncEvent::Refreshed { .. }) | Ok(SyncEvent::Failed(_)) if started => return true,
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
        }
    }
}

const REFRESH_WAIT: Duration = Duration::from_secs(30);

pub fn readiness_hint(readiness: Readiness) -> Option<&'static str> {
    match readiness {
        Readiness::NotInstalled => Some("the gh CLI is not installed; see `spacehop check`"),
        Readiness::NotAuthenticated => Some("gh is not authenticated; run `gh auth login`"),
        Readiness::ScopeRequired => {
            Some("gh token lacks the codespace scope; run `gh auth refresh -h github.com -s codespace`")
        }
        Readiness::Ready | Readiness::Unknown => None,
    }
}

/// Render a snapshot as a grouped table.
pub fn render_snapshot(snapshot: &SyncSnapshot, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    if let Some(issue) = &snapshot.last_error {
        let _ = writeln!(out, "error: {}", issue.message);
    }
    if snapshot.groups.is_empty() {
        let _ = writeln!(
            out,
            "No workspaces{}.",
            if snapshot.total > 0 { " match the filter" } else { "" }
        );
        return out;
    }

    for group in &snapshot.groups {
        let _ = writeln!(out, "{}", group.repository);
        for ws in &group.workspaces {
            let _ = writeln!(out, "  {}", render_row(ws, now));
        }
    }

    let shown: usize = snapshot.groups.iter().map(|g| g.workspaces.len()).sum();
    let mut footer = format!("{} of {} workspace(s)", shown, snapshot.total);
    if snapshot.loading {
        footer.push_str(", refreshing");
    } else if snapshot.poll_mode == PollMode::Fast {
        footer.push_str(", watching transitions");
    }
    if let Some(at) = snapshot.refreshed_at {
        let _ = write!(footer, ", refreshed {}", format_age(now, at));
    }
    let _ = writeln!(out, "{}", footer);
    out
}

fn render_row(ws: &Workspace, now: DateTime<Utc>) -> String {
    let mut columns = vec![
        format!("{:<32}", ws.name),
        format!("{:<14}", state_label(ws.state)),
        ws.branch.clone(),
    ];
    let git = git_summary(&ws.git_status);
    if !git.is_empty() {
        columns.push(git);
    }
    if let Some(machine) = &ws.machine {
        columns.push(machine.summary());
    }
    if let Some(used) = ws.last_used_at {
        columns.push(format!("used {}", format_age(now, used)));
    }
    if let Some(minutes) = ws.idle_timeout_minutes {
        columns.push(format!("idle timeout {}m", minutes));
    }
    columns.join("  ")
}

/// State name, with an ellipsis while the state is still changing.
pub fn state_label(state: WorkspaceState) -> String {
    if state.is_transitional() {
        format!("{}\u{2026}", state)
    } else {
        state.to_string()
    }
}

/// Compact ahead/behind/dirty marker, empty when clean and up to date.
pub fn git_summary(status: &VersionControlStatus) -> String {
    let mut parts = Vec::new();
    if status.ahead > 0 {
        parts.push(format!("\u{2191}{}", status.ahead));
    }
    if status.behind > 0 {
        parts.push(format!("\u{2193}{}", status.behind));
    }
    if status.has_uncommitted_changes {
        parts.push("*".to_string());
    }
    if status.has_unpushed_changes && status.ahead == 0 {
        parts.push("unpushed".to_string());
    }
    parts.join(" ")
}

/// Print stopped workspaces idle past the threshold.
pub fn print_stale(stale: &[&Workspace], threshold_days: u32, now: DateTime<Utc>) {
    if stale.is_empty() {
        println!("No stopped workspaces idle for more than {} days.", threshold_days);
        return;
    }
    println!(
        "{} stopped workspace(s) idle for more than {} days:",
        stale.len(),
        threshold_days
    );
    for ws in stale {
        let days = ws.last_used_at.map(|used| idle_days(used, now)).unwrap_or(0);
        println!("  {:<32} {:<24} {} days", ws.name, ws.repository, days);
    }
    println!("\nDelete with: spacehop delete <name>");
}

fn format_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0) as u64;
    format_duration(std::time::Duration::from_secs(secs))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (value, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86400, "day")
    };
    if value == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{RepositoryGroup, SyncIssue};
    use crate::workspace::tests::make_workspace;
    use crate::workspace::MachineProfile;
    use crate::error::ErrorKind;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn snapshot(groups: Vec<RepositoryGroup>, total: usize) -> SyncSnapshot {
        SyncSnapshot {
            loading: false,
            readiness: Readiness::Ready,
            last_error: None,
            groups,
            total,
            poll_mode: PollMode::Idle,
            refreshed_at: None,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(StdDuration::from_secs(0)), "0 seconds ago");
        assert_eq!(format_duration(StdDuration::from_secs(1)), "1 second ago");
        assert_eq!(format_duration(StdDuration::from_secs(120)), "2 minutes ago");
        assert_eq!(format_duration(StdDuration::from_secs(3600)), "1 hour ago");
        assert_eq!(format_duration(StdDuration::from_secs(86400 * 3)), "3 days ago");
    }

    #[test]
    fn test_format_age_clamps_future() {
        let now = Utc::now();
        assert_eq!(format_age(now, now + Duration::minutes(5)), "0 seconds ago");
    }

    #[test]
    fn test_state_label() {
        assert_eq!(state_label(WorkspaceState::Starting), "Starting\u{2026}");
        assert_eq!(state_label(WorkspaceState::Available), "Available");
    }

    #[test]
    fn test_git_summary() {
        let mut status = VersionControlStatus::default();
        assert_eq!(git_summary(&status), "");
        status.ahead = 2;
        status.behind = 1;
        status.has_uncommitted_changes = true;
        status.has_unpushed_changes = true;
        assert_eq!(git_summary(&status), "\u{2191}2 \u{2193}1 *");
        status.ahead = 0;
        assert_eq!(git_summary(&status), "\u{2193}1 * unpushed");
    }

    #[test]
    fn test_render_snapshot_rows() {
        let now = Utc::now();
        let mut ws = make_workspace("octo-app-x1", "octo/app", WorkspaceState::Available);
        ws.last_used_at = Some(now - Duration::hours(2));
        ws.machine = Some(MachineProfile {
            cpus: 4,
            memory_bytes: 16 << 30,
            storage_bytes: 32 << 30,
            display_label: "4 cores".into(),
        });
        ws.idle_timeout_minutes = Some(30);
        let groups = vec![RepositoryGroup {
            repository: "octo/app".into(),
            workspaces: vec![ws],
        }];
        let mut snap = snapshot(groups, 3);
        snap.poll_mode = PollMode::Fast;
        let out = render_snapshot(&snap, now);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "octo/app");
        assert!(lines[1].starts_with("  octo-app-x1"));
        assert!(lines[1].contains("4-core, 16 GB RAM, 32 GB"));
        assert!(lines[1].contains("used 2 hours ago"));
        assert!(lines[1].contains("idle timeout 30m"));
        assert_eq!(lines[2], "1 of 3 workspace(s), watching transitions");
    }

    #[test]
    fn test_render_snapshot_empty_and_error() {
        let mut snap = snapshot(Vec::new(), 0);
        snap.last_error = Some(SyncIssue {
            kind: ErrorKind::CommandFailed,
            message: "gh codespace list failed: HTTP 502".into(),
        });
        let out = render_snapshot(&snap, Utc::now());
        assert_eq!(out, "error: gh codespace list failed: HTTP 502\nNo workspaces.\n");

        let filtered = render_snapshot(&snapshot(Vec::new(), 4), Utc::now());
        assert_eq!(filtered, "No workspaces match the filter.\n");
    }

    #[test]
    fn test_readiness_hint() {
        assert!(readiness_hint(Readiness::Ready).is_none());
        assert!(readiness_hint(Readiness::ScopeRequired).unwrap().contains("-s codespace"));
    }

    #[test]
    fn test_check_ssh_dir_missing_parent_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        let check = check_ssh_dir(&dir.path().join("missing").join("config"));
        assert!(check.ok);
        assert!(check.detail.contains("created on first connect"));
    }

    #[test]
    fn test_render_snapshot_marks_refresh_in_progress() {
        let groups = vec![RepositoryGroup {
            repository: "octo/app".into(),
            workspaces: vec![make_workspace("a", "octo/app", WorkspaceState::Starting)],
        }];
        let mut snap = snapshot(groups, 1);
        snap.loading = true;
        snap.poll_mode = PollMode::Fast;
        let out = render_snapshot(&snap, Utc::now());
        assert!(out.ends_with("1 of 1 workspace(s), refreshing\n"));
    }

    #[tokio::test]
    async fn test_next_reload_skips_reload_already_in_flight() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(16);
        tx.send(SyncEvent::Refreshed { total: 1, transitional: 1 }).unwrap();
        tx.send(SyncEvent::Loading).unwrap();
        tx.send(SyncEvent::Refreshed { total: 1, transitional: 0 }).unwrap();
        assert!(next_reload(&mut rx).await);
        assert!(rx.try_recv().is_err());

        tx.send(SyncEvent::Refreshed { total: 1, transitional: 0 }).unwrap();
        drop(tx);
        assert!(!next_reload(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_print_after_change_waits_for_requested_reload() {
        use crate::directory::fake::FakeDirectory;
        use std::sync::Arc;

        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "octo/app", WorkspaceState::Available)]);
        let engine = SyncEngine::new(fake.clone(), &Config::default());

        engine.request_refresh();
        print_after_change(&engine, Outcome::Completed, Some("a")).await;
        assert_eq!(fake.count("list"), 1);
        assert_eq!(engine.poll_mode(), PollMode::Idle);

        let unchanged = SyncEngine::new(fake.clone(), &Config::default());
        print_after_change(&unchanged, Outcome::Unchanged, Some("a")).await;
        assert_eq!(fake.count("list"), 2);
    }
}
