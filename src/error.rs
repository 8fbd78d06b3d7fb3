//! Fatal error kinds of the conversion pipeline.
//!
//! Any of these aborts the run; there are no retries. I/O failures are
//! reported as `anyhow`-wrapped `std::io::Error` with path context at the
//! call sites instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// The source checkpoint carries no universal-metadata descriptor.
    #[error(
        "universal checkpoint metadata is missing from {path}; \
         verify that the producer emitted it"
    )]
    MissingUniversalMetadata { path: PathBuf },

    /// The concatenated DP fragments do not fill the expected shape.
    #[error(
        "parameter {name}: {actual} elements across fragments do not fill \
         expected shape {shape:?}"
    )]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        actual: usize,
    },

    /// A tensor-parallel replica differs from rank 0.
    #[error(
        "parameter {name}: tensor-parallel rank {rank} disagrees with rank 0 \
         but is declared replicated"
    )]
    ReplicationViolation { name: String, rank: usize },

    /// A fragment mapping points past the end of its flat tensor.
    #[error(
        "parameter {name}: fragment {start}+{numel} overruns flat {moment} \
         tensor of {len} elements"
    )]
    FragmentOutOfBounds {
        name: String,
        moment: &'static str,
        start: usize,
        numel: usize,
        len: usize,
    },

    /// The checkpoint record tree violates the expected schema.
    #[error("malformed checkpoint: {0}")]
    MalformedCheckpoint(String),

    /// A descriptor regex failed to compile.
    #[error("invalid parameter pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
