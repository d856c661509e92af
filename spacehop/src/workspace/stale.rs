use chrono::{DateTime, Duration, Utc};

use super::Workspace;

/// Stopped workspaces whose last use is older than `threshold_days` before `now`.
///
/// Running workspaces are governed by their idle timeout and are never flagged.
/// A workspace with no last-used timestamp is not flagged either.
pub fn find_stale(workspaces: &[Workspace], threshold_days: u32, now: DateTime<Utc>) -> Vec<&Workspace> {
    let cutoff = now - Duration::days(i64::from(threshold_days));
    workspaces
        .iter()
        .filter(|ws| ws.state.is_stopped())
        .filter(|ws| ws.last_used_at.is_some_and(|used| used < cutoff))
        .collect()
}

/// Whole days between `last_used` and `now`, for display.
pub fn idle_days(last_used: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - last_used).num_days().max(0)
}
