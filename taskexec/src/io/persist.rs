//! Output file persistence.

use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::types::TaskOutput;

const SHELL_METACHARACTERS: [char; 6] = ['|', '>', '<', '&', ';', '`'];

/// Reject output paths that are empty, escape upward, or look like shell syntax.
pub fn validate_output_path(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.trim().is_empty() {
        bail!("output file path must not be empty");
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        bail!("output file {text} contains path traversal");
    }
    if text.contains(SHELL_METACHARACTERS) || text.contains("$(") {
        bail!("output file {text} contains shell metacharacters");
    }
    Ok(())
}

/// Text written for an output: pretty JSON, canonical typed JSON, or raw text.
pub fn select_content(output: &TaskOutput) -> Result<String> {
    if let Some(json) = &output.json {
        let mut buf = serde_json::to_string_pretty(json).context("serialize json output")?;
        buf.push('\n');
        return Ok(buf);
    }
    if let Some(typed) = &output.typed {
        return Ok(typed.to_canonical_json());
    }
    Ok(output.raw.clone())
}

/// Writes task outputs to disk, replacing any previous content.
#[derive(Debug, Clone, Copy)]
pub struct OutputPersister {
    create_directory: bool,
}

impl OutputPersister {
    pub fn new(create_directory: bool) -> Self {
        Self { create_directory }
    }

    /// Atomically write `content` to `destination` (temp file + rename).
    pub fn persist(&self, content: &str, destination: &Path) -> Result<()> {
        validate_output_path(destination)?;
        let file_name = destination
            .file_name()
            .with_context(|| format!("output path has no file name {}", destination.display()))?;
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if !parent.is_dir() {
            if !self.create_directory {
                return Err(anyhow!(
                    "output directory {} does not exist",
                    parent.display()
                ));
            }
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
        fs::write(&tmp_path, content)
            .with_context(|| format!("write temp output {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, destination) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("replace output {}", destination.display()));
        }
        debug!(path = %destination.display(), bytes = content.len(), "persisted output");
        Ok(())
    }
}

impl Default for OutputPersister {
    fn default() -> Self {
        Self::new(true)
    }
}
