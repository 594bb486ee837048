//! Byte-safe incremental line reader (spec §4.1).
//!
//! Shared by the JSONL-append and JSONL-envelope sources. A partial line at
//! EOF (no trailing `\n`) is never consumed: the next offset always lands on
//! the start of that partial line, so a writer that appends in multiple
//! steps never loses or corrupts an entry.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::ParseError;

/// Lines read from a single incremental pass, plus the offset to resume from.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineBatch {
    pub lines: Vec<String>,
    pub new_offset: u64,
}

/// Read whole lines appended to `path` since `offset`.
///
/// Lines longer than `max_line_len` are skipped (offset still advances past
/// them, per the oversized-line policy); a file whose total length exceeds
/// `max_file_len` fails outright.
pub fn read_new_lines(
    path: &Path,
    offset: u64,
    max_line_len: usize,
    max_file_len: u64,
) -> Result<LineBatch, ParseError> {
    let mut file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| ParseError::io(path, e))?
        .len();

    if len > max_file_len {
        return Err(ParseError::ExceedsMax {
            path: path.to_path_buf(),
            size: len,
            max: max_file_len,
        });
    }

    if len <= offset {
        return Ok(LineBatch {
            lines: Vec::new(),
            new_offset: offset,
        });
    }

    file.seek(SeekFrom::Start(offset))
        .map_err(|e| ParseError::io(path, e))?;
    let mut buf = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut buf).map_err(|e| ParseError::io(path, e))?;

    Ok(split_lines(&buf, offset, max_line_len))
}

/// Pure byte-splitting core, separated out for fuzz/property testing without
/// touching the filesystem.
pub fn split_lines(buf: &[u8], base_offset: u64, max_line_len: usize) -> LineBatch {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line_bytes = &buf[start..i];
        if line_bytes.len() <= max_line_len {
            lines.push(String::from_utf8_lossy(line_bytes).into_owned());
        }
        start = i + 1;
    }

    LineBatch {
        lines,
        new_offset: base_offset + start as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("sessionwatch_lines_{name}.jsonl"));
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn reads_complete_lines_only() {
        let path = write_tmp("complete", b"one\ntwo\nthree\n");
        let batch = read_new_lines(&path, 0, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 1 << 20).unwrap();
        assert_eq!(batch.lines, vec!["one", "two", "three"]);
        assert_eq!(batch.new_offset, 14);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn trailing_partial_line_not_consumed() {
        let path = write_tmp("partial", b"one\ntwo\nthr");
        let batch = read_new_lines(&path, 0, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 1 << 20).unwrap();
        assert_eq!(batch.lines, vec!["one", "two"]);
        // offset parks right at the start of "thr"
        assert_eq!(batch.new_offset, 8);

        // Appending the rest and re-parsing from that offset recovers exactly
        // the previously-unparsed entry (§8.1).
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "ee").unwrap();
        drop(f);
        let batch2 = read_new_lines(&path, batch.new_offset, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 1 << 20).unwrap();
        assert_eq!(batch2.lines, vec!["three"]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unchanged_file_yields_same_offset_and_no_lines() {
        let path = write_tmp("unchanged", b"one\ntwo\n");
        let first = read_new_lines(&path, 0, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 1 << 20).unwrap();
        let second = read_new_lines(&path, first.new_offset, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 1 << 20).unwrap();
        assert!(second.lines.is_empty());
        assert_eq!(second.new_offset, first.new_offset);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn oversized_line_skipped_but_offset_advances() {
        let big = "x".repeat(50);
        let content = format!("{big}\nshort\n");
        let path = write_tmp("oversized_line", content.as_bytes());
        let batch = read_new_lines(&path, 0, 10, 1 << 20).unwrap();
        assert_eq!(batch.lines, vec!["short"]);
        assert_eq!(batch.new_offset, content.len() as u64);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn oversized_file_fails() {
        let path = write_tmp("oversized_file", b"hello\n");
        let err = read_new_lines(&path, 0, DEFAULT_MAX_LINE_LEN_FOR_TESTS, 2).unwrap_err();
        assert!(matches!(err, ParseError::ExceedsMax { .. }));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn nonexistent_file_is_io_error() {
        let err = read_new_lines(
            std::path::Path::new("/nonexistent/does/not/exist.jsonl"),
            0,
            DEFAULT_MAX_LINE_LEN_FOR_TESTS,
            1 << 20,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }

    #[test]
    fn split_lines_handles_empty_buffer() {
        let batch = split_lines(&[], 0, 100);
        assert!(batch.lines.is_empty());
        assert_eq!(batch.new_offset, 0);
    }

    #[test]
    fn split_lines_preserves_embedded_empty_lines() {
        let batch = split_lines(b"a\n\nb\n", 0, 100);
        assert_eq!(batch.lines, vec!["a", "", "b"]);
    }

    const DEFAULT_MAX_LINE_LEN_FOR_TESTS: usize = crate::error::DEFAULT_MAX_LINE_LEN;

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn new_offset_never_exceeds_buffer_len(buf in proptest::collection::vec(any::<u8>(), 0..500)) {
                let batch = split_lines(&buf, 0, 1 << 20);
                prop_assert!(batch.new_offset <= buf.len() as u64);
            }

            #[test]
            fn reparsing_from_new_offset_is_idempotent(buf in proptest::collection::vec(any::<u8>(), 0..500)) {
                let batch = split_lines(&buf, 0, 1 << 20);
                let rest = &buf[batch.new_offset as usize..];
                let second = split_lines(rest, batch.new_offset, 1 << 20);
                // No new complete lines can appear from already-consumed bytes re-split
                // at the same logical position as long as no bytes were appended.
                prop_assert!(second.lines.is_empty());
            }
        }
    }
}
