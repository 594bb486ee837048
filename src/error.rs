//! Error types for the source/parser boundary.
//!
//! Mirrors the split used by the daemon crates in the broader pack: a
//! `thiserror`-derived enum for anything a caller might want to match on
//! (oversized file vs. plain IO failure), with `anyhow` reserved for the
//! CLI edge in `main.rs`.

use std::path::PathBuf;

use thiserror::Error;

/// Default cap on a single logical JSONL line (§4.1 "Oversized-line policy").
pub const DEFAULT_MAX_LINE_LEN: usize = 2 * 1024 * 1024;

/// Default cap on total file size before `Parse` refuses to read further
/// (§4.1 "A file whose total size exceeds `maxFileSize`").
pub const DEFAULT_MAX_FILE_LEN: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} exceeds max file size ({size} > {max})")]
    ExceedsMax { path: PathBuf, size: u64, max: u64 },
}

impl ParseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ParseError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("failed walking {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DiscoverError {
    pub fn walk(root: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DiscoverError::Walk {
            root: root.into(),
            source,
        }
    }
}
