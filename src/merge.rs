//! Phase 2: merge DP fragments and TP slices into universal tensors.
//!
//! For each parameter and moment, the merger concatenates the DP fragments
//! of every TP rank (lexicographic file order is DP order), reshapes each to
//! the rank-local slice shape, then combines the slices across TP under the
//! parameter's merge rule. Vocabulary parameters additionally record a
//! padding tensor so the vocabulary dimension can be unpadded at load time;
//! the merged tensor itself is never stripped.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::classify::{MergeRule, UniversalMetadata};
use crate::error::ConvertError;
use crate::index::SourceIndex;
use crate::pool;
use crate::store::{self, Value};
use crate::tensor::Tensor;
use crate::types::{Moment, CAT_DIM, PARAM, VOCAB_DIVISIBILITY_PADDING_TENSOR};

/// Merge every parameter in the manifest using `workers` workers.
pub fn run(index: &SourceIndex, temp_dir: &Path, zero_dir: &Path, workers: usize) -> Result<()> {
    let items: Vec<(String, Vec<usize>)> = index
        .param_shapes()
        .iter()
        .map(|(name, shape)| (name.clone(), shape.clone()))
        .collect();
    let tp_degree = index.topology().tp;
    let metadata = index.metadata();

    pool::run_chunked(items, workers, "merge", |(name, shape)| {
        merge_param(metadata, tp_degree, temp_dir, zero_dir, &name, &shape)
            .with_context(|| format!("failed to merge parameter {name}"))
    })
}

/// Merge one parameter's three moments into universal records.
pub fn merge_param(
    metadata: &UniversalMetadata,
    tp_degree: usize,
    temp_dir: &Path,
    zero_dir: &Path,
    name: &str,
    slice_shape: &[usize],
) -> Result<()> {
    let rule = metadata.classify(name);
    debug!(name, ?rule, "merging tp slices");

    for moment in Moment::ALL {
        let slices = load_tp_slices(temp_dir, name, moment, tp_degree, slice_shape)?;

        let mut record = IndexMap::new();
        let merged = match rule {
            MergeRule::Replicate => {
                let (first, rest) = slices.split_first().ok_or_else(|| {
                    ConvertError::MalformedCheckpoint(format!("no slices for {name}"))
                })?;
                for (offset, slice) in rest.iter().enumerate() {
                    if !slice.bitwise_eq(first) {
                        return Err(ConvertError::ReplicationViolation {
                            name: name.to_string(),
                            rank: offset + 1,
                        }
                        .into());
                    }
                }
                first.clone()
            }
            MergeRule::Average => Tensor::mean(&slices)?,
            MergeRule::Concat { dim } => {
                record.insert(CAT_DIM.to_string(), Value::Int(dim as i64));
                Tensor::cat(&slices, dim)?
            }
        };

        if metadata.is_vocabulary(name) {
            let padding = vocab_padding_tensor(&merged, metadata.original_vocab_size)
                .with_context(|| format!("vocabulary annotation for {name}"))?;
            record.insert(
                VOCAB_DIVISIBILITY_PADDING_TENSOR.to_string(),
                Value::Tensor(padding),
            );
        }
        record.insert(PARAM.to_string(), Value::Tensor(merged));

        store::save(&moment_path(zero_dir, name, moment), &Value::Map(record))?;
    }
    Ok(())
}

/// Output path of one merged moment: `zero/<name>/<moment>.pt`.
pub fn moment_path(zero_dir: &Path, name: &str, moment: Moment) -> PathBuf {
    zero_dir.join(name).join(format!("{}.pt", moment.as_str()))
}

/// Rebuild each TP rank's slice from its DP fragment files.
fn load_tp_slices(
    temp_dir: &Path,
    name: &str,
    moment: Moment,
    tp_degree: usize,
    slice_shape: &[usize],
) -> Result<Vec<Tensor>> {
    let expected: usize = slice_shape.iter().product();
    let mut slices = Vec::with_capacity(tp_degree);
    for tp in 0..tp_degree {
        let dir = temp_dir.join(name).join(tp.to_string());
        let prefix = format!("{}.", moment.as_str());
        let mut paths = Vec::new();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read fragment directory {}", dir.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to scan {}", dir.display()))?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                paths.push(entry.path());
            }
        }
        if paths.is_empty() {
            return Err(ConvertError::MalformedCheckpoint(format!(
                "no {moment} fragments for {name} under {}",
                dir.display()
            ))
            .into());
        }
        // Lexicographic order is DP order: the DP index is zero-padded.
        paths.sort();

        let mut shards = Vec::with_capacity(paths.len());
        for path in &paths {
            shards.push(store::load(path)?.into_tensor("fragment")?);
        }
        let flat = Tensor::cat(&shards, 0)?;
        if flat.numel() != expected {
            return Err(ConvertError::ShapeMismatch {
                name: name.to_string(),
                shape: slice_shape.to_vec(),
                actual: flat.numel(),
            }
            .into());
        }
        slices.push(flat.reshape(slice_shape)?);
    }
    Ok(slices)
}

fn vocab_padding_tensor(merged: &Tensor, original_vocab_size: usize) -> Result<Tensor> {
    let shape = merged.shape();
    if shape.len() < 2 {
        return Err(ConvertError::MalformedCheckpoint(format!(
            "vocabulary parameter must have at least 2 dims, got {shape:?}"
        ))
        .into());
    }
    if shape[0] > original_vocab_size {
        merged.last_row()
    } else {
        Ok(Tensor::zeros(&[shape[1]]))
    }
}
