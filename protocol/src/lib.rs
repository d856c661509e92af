use serde::{Deserialize, Serialize};

/// Fields requested from `gh codespace list --json` and `gh codespace view --json`.
///
/// Both commands accept the same selector, so a single record type covers them.
pub const LIST_FIELDS: &str =
    "name,displayName,state,repository,gitStatus,lastUsedAt,createdAt,machineName,machineDisplayName";

/// REST path prefix for per-codespace detail lookups (`gh api /user/codespaces/<name>`).
pub const DETAILS_PATH_PREFIX: &str = "/user/codespaces";

// ---------------------------------------------------------------------------
// Listing records (camelCase, emitted by `gh codespace list/view --json`)
// ---------------------------------------------------------------------------

/// One codespace as reported by the listing command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodespaceRecord {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    /// PascalCase lifecycle state, e.g. `Available`, `ShuttingDown`.
    pub state: String,
    /// `owner/repo` of the repository the codespace was created from.
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub git_status: GitStatusRecord,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub last_used_at: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub machine_display_name: Option<String>,
}

/// Version-control status nested in a listing record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusRecord {
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub has_uncommitted_changes: bool,
    #[serde(default)]
    pub has_unpushed_changes: bool,
    /// Checked-out branch.
    #[serde(default, rename = "ref")]
    pub branch: String,
}

// ---------------------------------------------------------------------------
// REST detail records (snake_case, emitted by `gh api /user/codespaces/<name>`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodespaceDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub machine: Option<MachineRecord>,
    #[serde(default)]
    pub idle_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_in_bytes: u64,
    #[serde(default)]
    pub storage_in_bytes: u64,
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

/// Decode the JSON array printed by `gh codespace list --json`.
///
/// Empty output (no codespaces on some `gh` versions) decodes to an empty list.
pub fn decode_list(json: &str) -> Result<Vec<CodespaceRecord>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
}

/// Decode the single JSON object printed by `gh codespace view --json`.
pub fn decode_record(json: &str) -> Result<CodespaceRecord, serde_json::Error> {
    serde_json::from_str(json)
}

/// Decode the REST detail object for one codespace.
pub fn decode_details(json: &str) -> Result<CodespaceDetails, serde_json::Error> {
    serde_json::from_str(json)
}
