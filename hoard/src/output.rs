//! Output formatting for CLI commands.
//!
//! Results are written as text for people or as JSON for scripts.

use anyhow::Result;
use hoard_core::GcStats;
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write `data` as JSON, or the text produced by `text_fn`.
    ///
    /// `text_fn` only runs in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub repo: String,
}

/// Output for `gc`.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    #[serde(flatten)]
    pub stats: GcStats,
}

impl GcOutput {
    pub fn to_text(&self) -> String {
        let s = &self.stats;
        let verb = if self.dry_run { "Would delete" } else { "Deleted" };
        format!(
            "Reachable blobs: {}\n\
             Packs scanned: {} (skipped {})\n\
             {} {} packs, wrote {}\n\
             Blobs copied: {}, dropped: {}\n\
             Bytes reclaimed: {}\n",
            s.reachable,
            s.packs_scanned,
            s.packs_skipped,
            verb,
            s.packs_deleted,
            s.packs_written,
            s.blobs_copied,
            s.blobs_dropped,
            s.bytes_reclaimed,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    /// Signed tag value as stored.
    pub value: String,
    /// Root of the newest snapshot, once verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Snapshots in the tag's history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<usize>,
}

impl TagInfo {
    fn to_text(&self) -> String {
        match (&self.root, self.created_at, self.versions) {
            (Some(root), Some(created_at), Some(versions)) => format!(
                "{} -> {} (created {}, {} versions)\n",
                self.name, root, created_at, versions
            ),
            _ => format!("{} -> {}\n", self.name, self.value),
        }
    }
}

/// Output for `tags`.
#[derive(Debug, Serialize)]
pub struct TagsOutput {
    pub success: bool,
    pub result_code: u8,
    pub tags: Vec<TagInfo>,
}

impl TagsOutput {
    pub fn to_text(&self) -> String {
        if self.tags.is_empty() {
            return "No tags\n".to_string();
        }
        self.tags
            .iter()
            .map(TagInfo::to_text)
            .collect()
    }
}

/// Output for `cache-daemon` once it is listening.
#[derive(Debug, Serialize)]
pub struct DaemonOutput {
    pub success: bool,
    pub result_code: u8,
    pub listen: String,
    pub db: String,
    pub max_size: u64,
    pub entries: usize,
    pub size: u64,
}
