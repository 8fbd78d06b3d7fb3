//! Parameter classification against the universal-metadata descriptor.
//!
//! The descriptor carries five regex pattern lists. A parameter name resolves
//! to exactly one [`MergeRule`] with fixed priority (replicated, then
//! averaged, then concatenated), while vocabulary membership is a separate
//! annotation: a vocabulary parameter may still concatenate across TP ranks.

use anyhow::Result;
use regex::Regex;

use crate::error::ConvertError;
use crate::store::Value;
use crate::types::{
    ORIGINAL_VOCAB_SIZE, PARAMETER_TO_AVERAGE_PATTERNS, PARAMETER_WITH_ROW_PARALLELISM_PATTERNS,
    PIPELINE_REPLICATED_PARAMETER_PATTERNS, TP_REPLICATED_PARAMETER_PATTERNS,
    VOCABULARY_PARAMETER_PATTERNS,
};

/// How the TP slices of one parameter combine into the universal tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// All slices are identical; emit slice 0.
    Replicate,
    /// Emit the element-wise mean of the slices.
    Average,
    /// Concatenate the slices along `dim`.
    Concat { dim: usize },
}

/// A pattern list matched from the start of the parameter name.
///
/// Patterns are compiled once per run; each is anchored at the beginning of
/// the name, so `word_embeddings` matches `word_embeddings.weight` but not
/// `tied.word_embeddings`.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(patterns: &[String]) -> Result<Self, ConvertError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{p})")).map_err(|source| ConvertError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatternSet { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// The parsed universal-metadata descriptor.
#[derive(Debug)]
pub struct UniversalMetadata {
    pub pipeline_replicated: PatternSet,
    pub tp_replicated: PatternSet,
    pub average: PatternSet,
    pub row_parallel: PatternSet,
    pub vocabulary: PatternSet,
    pub original_vocab_size: usize,
}

impl UniversalMetadata {
    /// Parse the descriptor record. Missing pattern lists default to empty.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.expect_map("universal checkpoint metadata")?;
        let original_vocab_size = match map.get(ORIGINAL_VOCAB_SIZE) {
            Some(v) => v.expect_usize(ORIGINAL_VOCAB_SIZE)?,
            None => 0,
        };
        Ok(UniversalMetadata {
            pipeline_replicated: compile_list(value, PIPELINE_REPLICATED_PARAMETER_PATTERNS)?,
            tp_replicated: compile_list(value, TP_REPLICATED_PARAMETER_PATTERNS)?,
            average: compile_list(value, PARAMETER_TO_AVERAGE_PATTERNS)?,
            row_parallel: compile_list(value, PARAMETER_WITH_ROW_PARALLELISM_PATTERNS)?,
            vocabulary: compile_list(value, VOCABULARY_PARAMETER_PATTERNS)?,
            original_vocab_size,
        })
    }

    /// Resolve the merge rule for a parameter name.
    pub fn classify(&self, name: &str) -> MergeRule {
        if self.tp_replicated.matches(name) {
            MergeRule::Replicate
        } else if self.average.matches(name) {
            MergeRule::Average
        } else if self.row_parallel.matches(name) {
            MergeRule::Concat { dim: 1 }
        } else {
            MergeRule::Concat { dim: 0 }
        }
    }

    /// Whether the parameter carries vocabulary-dimension padding.
    pub fn is_vocabulary(&self, name: &str) -> bool {
        self.vocabulary.matches(name)
    }

    /// Whether only the first pipeline stage persists this parameter.
    pub fn is_pipeline_replicated(&self, name: &str) -> bool {
        self.pipeline_replicated.matches(name)
    }
}

fn compile_list(descriptor: &Value, key: &str) -> Result<PatternSet> {
    let Some(value) = descriptor.get(key) else {
        return Ok(PatternSet::default());
    };
    let patterns = value
        .expect_list(key)?
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                ConvertError::MalformedCheckpoint(format!("{key} entries must be strings"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PatternSet::compile(&patterns)?)
}
