//! Tool output truncation
//!
//! Output over the line or byte limit is cut to a preview. When an output
//! directory is configured the full text is written there first and the
//! preview tells the model where to find it.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, warn};

use crate::id::{self, prefix};

pub const MAX_LINES: usize = 2000;
pub const MAX_BYTES: usize = 50 * 1024;

/// Saved outputs older than this are removed by [`cleanup`]
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Which end of the output to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Head,
    Tail,
}

#[derive(Debug, Clone, Copy)]
pub struct TruncateOptions {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub direction: Direction,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        Self {
            max_lines: MAX_LINES,
            max_bytes: MAX_BYTES,
            direction: Direction::Head,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    pub truncated: bool,
    /// Where the full output was saved
    pub output_path: Option<PathBuf>,
}

const NARROW_HINT: &str = "The tool call succeeded but the output was truncated. \
Narrow the request (a more specific pattern, offset/limit, or a filter) to see the rest.";

fn saved_hint(path: &Path) -> String {
    format!(
        "The tool call succeeded but the output was truncated. Full output saved to: {}\n\
         Use Grep to search the full content or Read with offset/limit to view specific sections.",
        path.display()
    )
}

/// Default directory for saved outputs under the user's data directory
pub fn default_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("rho").join("tool-output"))
}

struct Preview<'a> {
    kept: Vec<&'a str>,
    removed: usize,
    unit: &'static str,
}

fn preview(text: &str, options: TruncateOptions) -> Option<Preview<'_>> {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= options.max_lines && text.len() <= options.max_bytes {
        return None;
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut bytes = 0;
    let mut hit_bytes = false;
    let ordered: Box<dyn Iterator<Item = &&str>> = match options.direction {
        Direction::Head => Box::new(lines.iter()),
        Direction::Tail => Box::new(lines.iter().rev()),
    };
    for line in ordered.take(options.max_lines) {
        let size = line.len() + usize::from(!kept.is_empty());
        if bytes + size > options.max_bytes {
            hit_bytes = true;
            break;
        }
        kept.push(*line);
        bytes += size;
    }
    if options.direction == Direction::Tail {
        kept.reverse();
    }

    let (removed, unit) = if hit_bytes {
        (text.len() - bytes, "bytes")
    } else {
        (lines.len() - kept.len(), "lines")
    };
    Some(Preview { kept, removed, unit })
}

async fn save(dir: &Path, text: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(id::ascending(prefix::TOOL));
    fs::write(&path, text).await?;
    Ok(path)
}

/// Cut `text` down to the line and byte limits, keeping whole lines.
///
/// With `dir` set, the untruncated text is written to a fresh file in it
/// and the hint names that file. A failed write falls back to the plain hint.
pub async fn output(text: &str, options: TruncateOptions, dir: Option<&Path>) -> Truncated {
    let Some(Preview { kept, removed, unit }) = preview(text, options) else {
        return Truncated {
            content: text.to_string(),
            truncated: false,
            output_path: None,
        };
    };

    let output_path = match dir {
        Some(dir) => match save(dir, text).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "could not save full tool output");
                None
            }
        },
        None => None,
    };
    let hint = match &output_path {
        Some(path) => saved_hint(path),
        None => NARROW_HINT.to_string(),
    };

    let preview = kept.join("\n");
    let content = match options.direction {
        Direction::Head => format!("{preview}\n\n...{removed} {unit} truncated...\n\n{hint}"),
        Direction::Tail => format!("...{removed} {unit} truncated...\n\n{hint}\n\n{preview}"),
    };
    Truncated {
        content,
        truncated: true,
        output_path,
    }
}

/// Delete saved outputs older than [`RETENTION`]. Returns how many went.
pub async fn cleanup(dir: &Path) -> std::io::Result<usize> {
    cleanup_older_than(dir, RETENTION).await
}

async fn cleanup_older_than(dir: &Path, age: Duration) -> std::io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let cutoff = SystemTime::now()
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        if metadata.modified()? <= cutoff {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    debug!(dir = %dir.display(), removed, "tool output cleanup");
    Ok(removed)
}
