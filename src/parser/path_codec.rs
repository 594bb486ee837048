//! Working-directory encoding/decoding for the Claude and Gemini sources
//! (spec §4.1).
//!
//! Claude's on-disk project directory name is a reversible-looking but
//! actually ambiguous `/`→`-` replace: a real directory containing a dash
//! collides with the path separator it stands in for. The decoder never
//! fails — it stats progressively more conservative re-joinings of the
//! encoded name against the live filesystem and falls back to a basename
//! guess if nothing resolves.
//!
//! Gemini instead hashes the working directory one-way with SHA-256, so
//! there is nothing to decode; `hash_project_path` is the encode-only half.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Encode a working directory into Claude's project-directory naming scheme.
pub fn encode_project_path(path: &str) -> String {
    path.replace('/', "-")
}

/// Best-effort decode of a Claude project-directory name back into a real
/// path. Always returns something; never panics or errors.
pub fn decode_project_dir(encoded: &str) -> String {
    let naive = naive_decode(encoded);
    if Path::new(&naive).is_dir() {
        return naive;
    }

    if let Some(resolved) = progressive_decode(encoded) {
        return resolved;
    }

    // Final fallback: just the basename of the naive decode.
    naive
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(naive)
}

/// Straight `-` → `/` replace, restoring the leading slash.
fn naive_decode(encoded: &str) -> String {
    match encoded.strip_prefix('-') {
        Some(rest) => format!("/{}", rest.replace('-', "/")),
        None => encoded.replace('-', "/"),
    }
}

/// Walk the encoded name segment by segment (splitting on the naive `-`
/// boundary), greedily re-merging a segment with its right neighbors using a
/// literal dash whenever the shorter split isn't a real directory on disk.
/// Bounded by the number of segments; never loops.
fn progressive_decode(encoded: &str) -> Option<String> {
    let stripped = encoded.strip_prefix('-').unwrap_or(encoded);
    let segments: Vec<&str> = stripped.split('-').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }

    let mut current = PathBuf::from("/");
    let mut i = 0;
    while i < segments.len() {
        let mut merged = segments[i].to_string();
        let mut j = i;
        while j + 1 < segments.len() {
            let candidate = current.join(&merged);
            if candidate.is_dir() {
                break;
            }
            j += 1;
            merged.push('-');
            merged.push_str(segments[j]);
        }
        current.push(&merged);
        i = j + 1;
    }

    current.is_dir().then(|| current.to_string_lossy().into_owned())
}

/// SHA-256 of the exact working-directory string, lowercase hex, full digest
/// (not truncated — distinct from hydra's truncated `project_id`).
pub fn hash_project_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    hex::encode(digest)
}
