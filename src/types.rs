//! Core types for checkpoint topology and optimizer layout.
//!
//! This module contains the fundamental types shared by the extraction and
//! merge phases, plus the key constants of the on-disk checkpoint schema.

use std::fmt;

/// Parallel topology of the source checkpoint.
///
/// The source stores `pp * tp` model rank files and `pp * tp * dp` optimizer
/// rank files; every degree is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Pipeline-parallel degree.
    pub pp: usize,
    /// Tensor-parallel degree.
    pub tp: usize,
    /// Data-parallel degree.
    pub dp: usize,
}

impl Topology {
    /// Create a new topology.
    pub fn new(pp: usize, tp: usize, dp: usize) -> Self {
        Topology { pp, tp, dp }
    }

    /// All `(pp, tp, dp)` triples in row-major order.
    pub fn ranks(&self) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::with_capacity(self.pp * self.tp * self.dp);
        for pp in 0..self.pp {
            for tp in 0..self.tp {
                for dp in 0..self.dp {
                    out.push((pp, tp, dp));
                }
            }
        }
        out
    }

    /// All `(pp, tp)` pairs in row-major order.
    pub fn model_ranks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.pp * self.tp);
        for pp in 0..self.pp {
            for tp in 0..self.tp {
                out.push((pp, tp));
            }
        }
        out
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pp={} tp={} dp={}", self.pp, self.tp, self.dp)
    }
}

/// Optimizer moment kinds stored per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Moment {
    /// Master fp32 weights.
    Fp32,
    /// First Adam moment.
    ExpAvg,
    /// Second Adam moment.
    ExpAvgSq,
}

impl Moment {
    /// All moments, in output order.
    pub const ALL: [Moment; 3] = [Moment::Fp32, Moment::ExpAvg, Moment::ExpAvgSq];

    /// The on-disk name of this moment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Moment::Fp32 => "fp32",
            Moment::ExpAvg => "exp_avg",
            Moment::ExpAvgSq => "exp_avg_sq",
        }
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Location of one parameter's data inside a flat optimizer tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSlice {
    /// Element offset into the flat tensor.
    pub start: usize,
    /// Number of elements.
    pub numel: usize,
}

// Checkpoint schema keys, matching the producer's record layout.
pub const OPTIMIZER_STATE_DICT: &str = "optimizer_state_dict";
pub const BASE_OPTIMIZER_STATE: &str = "base_optimizer_state";
pub const SINGLE_PARTITION_OF_FP32_GROUPS: &str = "single_partition_of_fp32_groups";
pub const PARAM_SLICE_MAPPINGS: &str = "param_slice_mappings";
pub const STATE: &str = "state";
pub const PARAM_GROUPS: &str = "param_groups";
pub const FRAGMENT_START: &str = "start";
pub const FRAGMENT_NUMEL: &str = "numel";
pub const PARAM_SHAPES: &str = "param_shapes";
pub const CHECKPOINT_ARGS: &str = "args";
pub const ITERATION: &str = "iteration";
pub const UNIVERSAL_CHECKPOINT_INFO: &str = "universal_checkpoint_info";

pub const TP_SIZE_ARG: &str = "tensor_model_parallel_size";
pub const PP_SIZE_ARG: &str = "pipeline_model_parallel_size";
pub const DP_SIZE_ARG: &str = "data_parallel_size";

pub const PIPELINE_REPLICATED_PARAMETER_PATTERNS: &str = "pipeline_replicated_parameter_patterns";
pub const TP_REPLICATED_PARAMETER_PATTERNS: &str = "tp_replicated_parameter_patterns";
pub const PARAMETER_TO_AVERAGE_PATTERNS: &str = "parameter_to_average_patterns";
pub const PARAMETER_WITH_ROW_PARALLELISM_PATTERNS: &str = "parameter_with_row_parallelism_patterns";
pub const VOCABULARY_PARAMETER_PATTERNS: &str = "vocabulary_parameter_patterns";
pub const ORIGINAL_VOCAB_SIZE: &str = "original_vocab_size";

pub const PARAM: &str = "param";
pub const CAT_DIM: &str = "cat_dim";
pub const VOCAB_DIVISIBILITY_PADDING_TENSOR: &str = "vocab_divisibility_padding_tensor";

pub const MODEL_FILE_NAME: &str = "model_optim_rng.pt";
pub const OPTIMIZER_STATE_FILE_NAME: &str = "optimizer_state.pt";
pub const LATEST_UNIVERSAL_FILE_NAME: &str = "latest_universal";
pub const TEMP_DIR_NAME: &str = "tmp";
pub const ZERO_DIR_NAME: &str = "zero";
