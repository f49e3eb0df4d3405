use std::path::Path;

use tracing::{debug, warn};

use machinist_core::error::Result;

/// A manual document loaded from disk.
#[derive(Debug, Clone)]
pub struct ManualDocument {
    /// Source identifier — the file name.
    pub source: String,
    pub text: String,
}

/// Load plain-text manuals (`.txt`, `.md`) from a directory.
///
/// Unsupported file types are skipped; an unreadable file is logged and
/// skipped rather than failing the whole ingest.
pub fn load_documents(dir: &Path) -> Result<Vec<ManualDocument>> {
    let mut documents = Vec::new();

    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Manuals directory not found; nothing to ingest");
        return Ok(documents);
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let is_text = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md")
        );
        if !is_text {
            continue;
        }

        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(source = %source, bytes = text.len(), "Loaded manual");
                documents.push(ManualDocument { source, text });
            }
            Err(e) => {
                warn!(source = %source, error = %e, "Skipping unreadable manual");
            }
        }
    }

    Ok(documents)
}

/// Split text into overlapping chunks of roughly `chunk_size` characters.
///
/// Prefers to break at a paragraph boundary, then a line break, then a
/// sentence end within the tail of the window; falls back to a hard cut.
/// Always cuts on char boundaries.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let overlap = overlap.min(chunk_size / 2);

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if hard_end < chars.len() {
            find_break(&chars, start, hard_end)
        } else {
            hard_end
        };

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Pick a break position in `(start, hard_end]`, preferring natural
/// boundaries inside the last quarter of the window.
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window_start = start + (hard_end - start) * 3 / 4;

    // Paragraph break: blank line
    for i in (window_start..hard_end.saturating_sub(1)).rev() {
        if chars[i] == '\n' && chars[i + 1] == '\n' {
            return i + 1;
        }
    }
    // Line break
    for i in (window_start..hard_end).rev() {
        if chars[i] == '\n' {
            return i + 1;
        }
    }
    // Sentence end
    for i in (window_start..hard_end).rev() {
        if matches!(chars[i], '.' | '!' | '?') {
            return i + 1;
        }
    }
    hard_end
}
