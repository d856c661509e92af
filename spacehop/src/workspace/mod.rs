pub mod orchestrate;
pub mod stale;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spacehop_protocol::{CodespaceRecord, GitStatusRecord, MachineRecord};

use crate::directory::ActivityRefinement;

/// Workspace lifecycle states as reported by the management tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkspaceState {
    Available,
    Shutdown,
    Starting,
    ShuttingDown,
    Provisioning,
    Rebuilding,
    Exporting,
    Updating,
    Awaiting,
    Unavailable,
    /// Requires a rebuild to recover.
    Failed,
    Deleted,
    Moved,
    /// Any state string this build does not recognise.
    Unknown,
}

impl WorkspaceState {
    /// States that are in progress toward a stable state. Drives fast polling.
    pub const TRANSITIONAL: [WorkspaceState; 6] = [
        Self::Starting,
        Self::ShuttingDown,
        Self::Provisioning,
        Self::Rebuilding,
        Self::Exporting,
        Self::Updating,
    ];

    /// Parse a state string. Never fails: unrecognised values map to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Available" => Self::Available,
            "Shutdown" => Self::Shutdown,
            "Starting" => Self::Starting,
            "ShuttingDown" => Self::ShuttingDown,
            "Provisioning" => Self::Provisioning,
            "Rebuilding" => Self::Rebuilding,
            "Exporting" => Self::Exporting,
            "Updating" => Self::Updating,
            "Awaiting" => Self::Awaiting,
            "Unavailable" => Self::Unavailable,
            "Failed" => Self::Failed,
            "Deleted" => Self::Deleted,
            "Moved" => Self::Moved,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Shutdown => "Shutdown",
            Self::Starting => "Starting",
            Self::ShuttingDown => "ShuttingDown",
            Self::Provisioning => "Provisioning",
            Self::Rebuilding => "Rebuilding",
            Self::Exporting => "Exporting",
            Self::Updating => "Updating",
            Self::Awaiting => "Awaiting",
            Self::Unavailable => "Unavailable",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
            Self::Moved => "Moved",
            Self::Unknown => "Unknown",
        }
    }

    pub fn is_transitional(self) -> bool {
        Self::TRANSITIONAL.contains(&self)
    }

    pub fn is_running(self) -> bool {
        self == Self::Available
    }

    pub fn is_stopped(self) -> bool {
        self == Self::Shutdown
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Moved)
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-category filter applied by the synchronization engine at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFilter {
    #[default]
    All,
    Running,
    Stopped,
    Transitional,
}

impl StateFilter {
    pub fn matches(self, state: WorkspaceState) -> bool {
        match self {
            Self::All => true,
            Self::Running => state.is_running(),
            Self::Stopped => state.is_stopped(),
            Self::Transitional => state.is_transitional(),
        }
    }
}

impl std::str::FromStr for StateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "transitional" => Ok(Self::Transitional),
            other => Err(format!(
                "unknown state filter '{}' (expected all, running, stopped or transitional)",
                other
            )),
        }
    }
}

/// Ahead/behind counts and dirty flags for the workspace's checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionControlStatus {
    pub ahead: u32,
    pub behind: u32,
    pub has_uncommitted_changes: bool,
    pub has_unpushed_changes: bool,
}

impl VersionControlStatus {
    pub fn is_clean(&self) -> bool {
        self.ahead == 0 && !self.has_uncommitted_changes && !self.has_unpushed_changes
    }
}

impl From<&GitStatusRecord> for VersionControlStatus {
    fn from(record: &GitStatusRecord) -> Self {
        Self {
            ahead: record.ahead,
            behind: record.behind,
            has_uncommitted_changes: record.has_uncommitted_changes,
            has_unpushed_changes: record.has_unpushed_changes,
        }
    }
}

/// Hardware backing a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineProfile {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub display_label: String,
}

impl MachineProfile {
    /// Compact label such as `4-core, 16 GB RAM, 32 GB`.
    pub fn summary(&self) -> String {
        const GB: u64 = 1024 * 1024 * 1024;
        format!(
            "{}-core, {} GB RAM, {} GB",
            self.cpus,
            self.memory_bytes / GB,
            self.storage_bytes / GB
        )
    }
}

impl From<MachineRecord> for MachineProfile {
    fn from(record: MachineRecord) -> Self {
        Self {
            cpus: record.cpus,
            memory_bytes: record.memory_in_bytes,
            storage_bytes: record.storage_in_bytes,
            display_label: record.display_name,
        }
    }
}

/// A remotely hosted development environment.
///
/// `name` is unique and immutable. Instances are rebuilt wholesale on every
/// refresh; presentation code never assigns `state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub display_name: String,
    pub state: WorkspaceState,
    /// `owner/repo`.
    pub repository: String,
    pub branch: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub git_status: VersionControlStatus,
    pub machine: Option<MachineProfile>,
    pub idle_timeout_minutes: Option<u32>,
}

impl Workspace {
    pub fn from_record(record: CodespaceRecord) -> Self {
        let git_status = VersionControlStatus::from(&record.git_status);
        Self {
            state: WorkspaceState::parse(&record.state),
            display_name: if record.display_name.is_empty() {
                record.name.clone()
            } else {
                record.display_name
            },
            name: record.name,
            repository: record.repository,
            branch: record.git_status.branch,
            last_used_at: record.last_used_at.as_deref().and_then(parse_timestamp),
            created_at: record.created_at.as_deref().and_then(parse_timestamp),
            git_status,
            machine: None,
            idle_timeout_minutes: None,
        }
    }

    /// Merge a per-item activity fetch. Values from the refinement win when present.
    pub fn apply_activity(&mut self, activity: ActivityRefinement) {
        if let Some(minutes) = activity.idle_timeout_minutes {
            self.idle_timeout_minutes = Some(minutes);
        }
        if let Some(last_used) = activity.last_used_at {
            self.last_used_at = Some(last_used);
        }
    }
}

/// Parse an RFC 3339 timestamp, returning `None` for anything malformed.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    /// Minimal workspace used across module tests.
    pub(crate) fn make_workspace(name: &str, repository: &str, state: WorkspaceState) -> Workspace {
        Workspace {
            name: name.to_string(),
            display_name: name.to_string(),
            state,
            repository: repository.to_string(),
            branch: "main".to_string(),
            last_used_at: Some(Utc::now()),
            created_at: Some(Utc::now() - Duration::days(30)),
            git_status: VersionControlStatus::default(),
            machine: None,
            idle_timeout_minutes: None,
        }
    }

    #[test]
    fn state_parse_known_values() {
        for state in [
            WorkspaceState::Available,
            WorkspaceState::Shutdown,
            WorkspaceState::ShuttingDown,
            WorkspaceState::Failed,
            WorkspaceState::Moved,
        ] {
            assert_eq!(WorkspaceState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn state_parse_unknown_values() {
        assert_eq!(WorkspaceState::parse("Queued"), WorkspaceState::Unknown);
        assert_eq!(WorkspaceState::parse(""), WorkspaceState::Unknown);
        assert_eq!(WorkspaceState::parse("available"), WorkspaceState::Unknown);
    }

    #[test]
    fn transitional_classification() {
        let transitional: Vec<_> = [
            WorkspaceState::Available,
            WorkspaceState::Shutdown,
            WorkspaceState::Starting,
            WorkspaceState::ShuttingDown,
            WorkspaceState::Provisioning,
            WorkspaceState::Rebuilding,
            WorkspaceState::Exporting,
            WorkspaceState::Updating,
            WorkspaceState::Awaiting,
            WorkspaceState::Unavailable,
            WorkspaceState::Failed,
            WorkspaceState::Deleted,
        ]
        .into_iter()
        .filter(|s| s.is_transitional())
        .collect();
        assert_eq!(transitional, WorkspaceState::TRANSITIONAL.to_vec());
        assert!(!WorkspaceState::Awaiting.is_transitional());
        assert!(WorkspaceState::Deleted.is_terminal());
    }

    #[test]
    fn state_filter_matches() {
        assert!(StateFilter::All.matches(WorkspaceState::Failed));
        assert!(StateFilter::Running.matches(WorkspaceState::Available));
        assert!(!StateFilter::Running.matches(WorkspaceState::Starting));
        assert!(StateFilter::Stopped.matches(WorkspaceState::Shutdown));
        assert!(StateFilter::Transitional.matches(WorkspaceState::Rebuilding));
        assert_eq!("Running".parse::<StateFilter>().unwrap(), StateFilter::Running);
        assert!("sleeping".parse::<StateFilter>().is_err());
    }

    #[test]
    fn from_record_converts_fields() {
        let record = CodespaceRecord {
            name: "octo-x1".into(),
            display_name: String::new(),
            state: "ShuttingDown".into(),
            repository: "octo/app".into(),
            git_status: GitStatusRecord {
                ahead: 1,
                behind: 3,
                has_uncommitted_changes: false,
                has_unpushed_changes: true,
                branch: "dev".into(),
            },
            last_used_at: Some("2024-05-01T10:00:00Z".into()),
            created_at: Some("garbage".into()),
            machine_name: None,
            machine_display_name: None,
        };
        let ws = Workspace::from_record(record);
        assert_eq!(ws.display_name, "octo-x1");
        assert_eq!(ws.state, WorkspaceState::ShuttingDown);
        assert_eq!(ws.branch, "dev");
        assert_eq!(ws.git_status.behind, 3);
        assert!(!ws.git_status.is_clean());
        assert_eq!(
            ws.last_used_at,
            Some(parse_timestamp("2024-05-01T10:00:00Z").unwrap())
        );
        assert!(ws.created_at.is_none());
        assert!(ws.machine.is_none());
    }

    #[test]
    fn activity_refinement_wins_when_present() {
        let mut ws = make_workspace("a", "o/r", WorkspaceState::Available);
        let listed = ws.last_used_at;
        ws.apply_activity(ActivityRefinement {
            idle_timeout_minutes: Some(45),
            last_used_at: None,
        });
        assert_eq!(ws.idle_timeout_minutes, Some(45));
        assert_eq!(ws.last_used_at, listed);

        let refined = Utc::now() - Duration::hours(2);
        ws.apply_activity(ActivityRefinement {
            idle_timeout_minutes: None,
            last_used_at: Some(refined),
        });
        assert_eq!(ws.last_used_at, Some(refined));
        assert_eq!(ws.idle_timeout_minutes, Some(45));
    }

    #[test]
    fn machine_profile_summary() {
        let profile = MachineProfile::from(MachineRecord {
            name: "standardLinux32gb".into(),
            display_name: "4 cores".into(),
            cpus: 4,
            memory_in_bytes: 16 * 1024 * 1024 * 1024,
            storage_in_bytes: 32 * 1024 * 1024 * 1024,
        });
        assert_eq!(profile.summary(), "4-core, 16 GB RAM, 32 GB");
        assert_eq!(profile.display_label, "4 cores");
    }
}
