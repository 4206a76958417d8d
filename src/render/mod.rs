//! Token substitution over rendered file trees
//!
//! Materialized gitops content carries `{{tokenName}}` placeholders. The
//! renderer walks a file tree and substitutes each placeholder byte-for-byte
//! from a supplied mapping. Missing tokens leave the placeholder intact, so
//! rendering is non-fatal and idempotent; binary files pass through
//! unchanged unless they happen to contain a placeholder.

mod tokens;

pub use tokens::{config_key_tokens, gitops_tokens};

use std::collections::BTreeMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::Result;

/// Substitute every `{{token}}` occurrence in `haystack`
fn render_bytes(haystack: &[u8], tokens: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = haystack.to_vec();
    for (token, replacement) in tokens {
        let needle = format!("{{{{{token}}}}}").into_bytes();
        out = replace_all(&out, &needle, replacement.as_bytes());
    }
    out
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(idx) = find(rest, needle) {
        out.extend_from_slice(&rest[..idx]);
        out.extend_from_slice(replacement);
        rest = &rest[idx + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Render every regular file under `root`, in place
///
/// `.git` directories are left untouched; file permissions are preserved
/// because files are rewritten, never recreated.
pub fn render_tree(root: &Path, tokens: &BTreeMap<String, String>) -> Result<()> {
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| {
            crate::error::Error::Io(std::io::Error::other(format!(
                "walking {}: {e}",
                root.display()
            )))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let original = std::fs::read(path)?;
        let rendered = render_bytes(&original, tokens);
        if rendered != original {
            std::fs::write(path, rendered)?;
        }
    }
    Ok(())
}
