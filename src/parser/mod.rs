//! Shared parsing primitives used by every [`crate::source::Source`] impl:
//! the incremental line reader, RFC3339 timestamp parsing, and the two
//! project-path codecs (spec §4.1).

mod lines;
mod path_codec;
mod timestamp;

pub use lines::{read_new_lines, split_lines, LineBatch};
pub use path_codec::{decode_project_dir, encode_project_path, hash_project_path};
pub use timestamp::parse_rfc3339;
