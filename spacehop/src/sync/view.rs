use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use serde::Serialize;

use crate::workspace::{StateFilter, Workspace};

/// Read-time predicate over the cached collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub text: String,
    pub state: StateFilter,
}

impl Filter {
    /// Case-insensitive substring match over name, display name, repository and
    /// branch, combined with the state category.
    pub fn matches(&self, ws: &Workspace) -> bool {
        if !self.state.matches(ws.state) {
            return false;
        }
        let needle = self.text.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [&ws.name, &ws.display_name, &ws.repository, &ws.branch]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Workspaces sharing one repository, already sorted for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryGroup {
    pub repository: String,
    pub workspaces: Vec<Workspace>,
}

impl RepositoryGroup {
    pub fn has_running(&self) -> bool {
        self.workspaces.iter().any(|ws| ws.state.is_running())
    }
}

fn workspace_order(a: &Workspace, b: &Workspace) -> Ordering {
    let rank = |ws: &Workspace| (Reverse(ws.state.is_running()), Reverse(ws.last_used_at));
    rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
}

/// Filter, group by repository and sort.
///
/// Within a group running workspaces come first, then most recently used.
/// Groups with a running member come first, then alphabetical by repository.
pub fn build_view(workspaces: &[Workspace], filter: &Filter) -> Vec<RepositoryGroup> {
    let mut by_repo: BTreeMap<&str, Vec<Workspace>> = BTreeMap::new();
    for ws in workspaces.iter().filter(|ws| filter.matches(ws)) {
        by_repo
            .entry(ws.repository.as_str())
            .or_default()
            .push(ws.clone());
    }

    let mut groups: Vec<RepositoryGroup> = by_repo
        .into_iter()
        .map(|(repository, mut workspaces)| {
            workspaces.sort_by(workspace_order);
            RepositoryGroup {
                repository: repository.to_string(),
                workspaces,
            }
        })
        .collect();
    // Stable sort keeps the alphabetical order from the BTreeMap within each tier.
    groups.sort_by_key(|g| Reverse(g.has_running()));
    groups
}
