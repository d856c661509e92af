//! Managed block inside the user's SSH client configuration file.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{format_entry, parse_entries, SshEntry};
use crate::error::{Result, SpaceError};

pub const BLOCK_START: &str = "# >>> spacehop managed block >>>";
pub const BLOCK_END: &str = "# <<< spacehop managed block <<<";

/// Tighten an existing file to 0600. A missing file is left alone.
async fn restrict_mode(path: &Path) -> Result<()> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.permissions().mode() & 0o777 != 0o600 {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        debug!(path = %path.display(), "restored ssh config permissions");
    }
    Ok(())
}

/// Byte ranges of the managed block: `(start_line_begin, end_line_end)`.
fn locate_block(content: &str) -> Result<Option<(usize, usize)>> {
    let mut offset = 0;
    let mut start = None;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        match start {
            None if trimmed == BLOCK_START => start = Some(offset),
            Some(begin) if trimmed == BLOCK_END => {
                return Ok(Some((begin, offset + line.len())));
            }
            _ => {}
        }
        offset += line.len();
    }
    match start {
        Some(_) => Err(SpaceError::parse(
            "ssh config",
            format!("'{}' has no matching '{}'", BLOCK_START, BLOCK_END),
        )),
        None => Ok(None),
    }
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Drop blank lines at the end of `text`, keeping everything else as-is.
fn trim_trailing_blank_lines(text: &str) -> &str {
    let mut end = text.len();
    for line in text.split_inclusive('\n').rev() {
        if !is_blank(line) {
            break;
        }
        end -= line.len();
    }
    text[..end].strip_suffix('\n').unwrap_or(&text[..end])
}

/// Drop blank lines at the start of `text`.
fn trim_leading_blank_lines(text: &str) -> &str {
    let mut begin = 0;
    for line in text.split_inclusive('\n') {
        if !is_blank(line) {
            break;
        }
        begin += line.len();
    }
    let rest = &text[begin..];
    rest.strip_suffix('\n').unwrap_or(rest)
}

/// Rebuild `existing` with the managed block holding exactly `entries`.
///
/// Text outside the block is preserved except for blank lines at the seams. An
/// empty entry set removes the block. All entries are validated before any
/// output is produced.
pub fn render_managed(existing: &str, entries: &[SshEntry]) -> Result<String> {
    let formatted = entries
        .iter()
        .map(format_entry)
        .collect::<Result<Vec<_>>>()?;

    let (before, after) = match locate_block(existing)? {
        Some((start, end)) => (&existing[..start], &existing[end..]),
        None => (existing, ""),
    };
    let before = trim_trailing_blank_lines(before);
    let after = trim_leading_blank_lines(after);

    let block = if formatted.is_empty() {
        None
    } else {
        Some(format!(
            "{}\n{}{}",
            BLOCK_START,
            formatted.join("\n"),
            BLOCK_END
        ))
    };

    let parts: Vec<&str> = [Some(before), block.as_deref(), Some(after)]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("{}\n", parts.join("\n\n")))
}

/// Alias of the first entry inside the managed block, if any.
pub fn managed_alias(content: &str) -> Option<String> {
    let (start, end) = locate_block(content).ok()??;
    parse_entries(&content[start..end])
        .into_iter()
        .next()
        .map(|e| e.alias)
}

/// The SSH configuration file this process manages a block in.
///
/// Callers serialize [`SshConfigFile::merge`] for a given path.
#[derive(Debug, Clone)]
pub struct SshConfigFile {
    path: PathBuf,
}

impl SshConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The file writes land on: the symlink target when `path` is a link.
    async fn target(&self) -> Result<PathBuf> {
        match tokio::fs::symlink_metadata(&self.path).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                match tokio::fs::canonicalize(&self.path).await {
                    Ok(resolved) => Ok(resolved),
                    // Dangling link: create the file it points at.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        let link = tokio::fs::read_link(&self.path).await?;
                        Ok(match self.path.parent() {
                            Some(parent) if link.is_relative() => parent.join(link),
                            _ => link,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Ok(_) => Ok(self.path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self.path.clone()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the managed block with `entry`, or remove it when `None`.
    ///
    /// A symlinked config is updated through the link; the link itself stays.
    pub async fn merge(&self, entry: Option<&SshEntry>) -> Result<()> {
        let existing = self.read().await?;
        let entries: Vec<SshEntry> = entry.into_iter().cloned().collect();
        let rendered = render_managed(&existing, &entries)?;
        let target = self.target().await?;

        if rendered == existing {
            debug!(path = %target.display(), "ssh config unchanged");
            return restrict_mode(&target).await;
        }

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !tokio::fs::try_exists(parent).await? {
                tokio::fs::create_dir_all(parent).await?;
                tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .await?;
            }
        }

        let tmp_path = target.with_extension("spacehop.tmp");
        tokio::fs::write(&tmp_path, &rendered).await?;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        tokio::fs::rename(&tmp_path, &target).await?;

        info!(
            path = %target.display(),
            alias = entry.map(|e| e.alias.as_str()).unwrap_or("-"),
            "updated ssh config managed block"
        );
        Ok(())
    }

    /// Alias currently recorded in the managed block.
    pub async fn current_alias(&self) -> Result<Option<String>> {
        Ok(managed_alias(&self.read().await?))
    }
}
