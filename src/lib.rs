//! uckpt - universal checkpoint transcoder library.
//!
//! Converts a training checkpoint sharded across pipeline (PP), tensor (TP),
//! and data (DP) parallelism into a universal checkpoint where every
//! parameter is a single contiguous tensor bundled with its Adam moments,
//! reloadable under any other `(PP, TP, DP)` configuration.
//!
//! # Pipeline
//!
//! 1. Index the source checkpoint (degrees, parameter manifest, descriptor)
//! 2. Extract: split each rank's flat optimizer tensors into per-parameter
//!    fragments on disk
//! 3. Merge: rebuild per-TP slices from DP fragments, then combine across TP
//!    under the parameter's merge rule
//! 4. Finalize: residual optimizer state, auxiliary copies, latest pointer
//!
//! # Example
//!
//! ```ignore
//! use uckpt::{extract, finalize, merge, SourceIndex};
//!
//! let index = SourceIndex::open(input.as_path())?;
//! extract::run(&index, &temp_dir, 4)?;
//! merge::run(&index, &temp_dir, &zero_dir, 2)?;
//! finalize::write_optimizer_state(&index, &zero_dir)?;
//! finalize::copy_aux_files(input.as_path(), output.as_path())?;
//! finalize::write_latest_pointer(output.as_path())?;
//! ```

pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod finalize;
pub mod index;
pub mod merge;
pub mod pool;
pub mod store;
pub mod tensor;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use classify::{MergeRule, PatternSet, UniversalMetadata};
pub use config::Config;
pub use error::ConvertError;
pub use index::SourceIndex;
pub use store::Value;
pub use tensor::Tensor;
pub use types::{Moment, Topology};
