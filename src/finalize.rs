//! Phase 3: residual optimizer state, auxiliary copies, latest pointer.
//!
//! Everything sharded was already rewritten by the merge phase; what remains
//! is the rank-invariant tail of the checkpoint. The `latest_universal`
//! pointer is written last so downstream loaders never observe a partially
//! written output.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::ConvertError;
use crate::index::SourceIndex;
use crate::store::{self, Value};
use crate::types::{
    BASE_OPTIMIZER_STATE, LATEST_UNIVERSAL_FILE_NAME, OPTIMIZER_STATE_DICT,
    OPTIMIZER_STATE_FILE_NAME, PARAM_SLICE_MAPPINGS, SINGLE_PARTITION_OF_FP32_GROUPS,
};

const SHARDED_STATE_KEYS: [&str; 3] = [
    BASE_OPTIMIZER_STATE,
    PARAM_SLICE_MAPPINGS,
    SINGLE_PARTITION_OF_FP32_GROUPS,
];

/// Save the non-sharded remainder of the `(0, 0, 0)` optimizer state.
pub fn write_optimizer_state(index: &SourceIndex, zero_dir: &Path) -> Result<()> {
    let record = store::load(&index.optimizer_file(0, 0, 0))?;
    let optim = record
        .require(OPTIMIZER_STATE_DICT)?
        .expect_map("optimizer state dict")?;

    let residual: IndexMap<String, Value> = optim
        .iter()
        .filter(|(key, _)| !SHARDED_STATE_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    store::save(
        &zero_dir.join(OPTIMIZER_STATE_FILE_NAME),
        &Value::Map(residual),
    )
}

/// Copy every regular `mp*` file from the input root to the output root.
pub fn copy_aux_files(input: &Path, output: &Path) -> Result<usize> {
    let mut copied = 0;
    let entries = fs::read_dir(input)
        .with_context(|| format!("failed to read input folder {}", input.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to scan {}", input.display()))?;
        let name = entry.file_name();
        if !entry.file_type()?.is_file() || !name.to_string_lossy().starts_with("mp") {
            continue;
        }
        let target = output.join(&name);
        fs::copy(entry.path(), &target).with_context(|| {
            format!(
                "failed to copy {} to {}",
                entry.path().display(),
                target.display()
            )
        })?;
        debug!(file = %name.to_string_lossy(), "copied auxiliary file");
        copied += 1;
    }
    Ok(copied)
}

/// Point `latest_universal` in the output's parent at the output folder.
pub fn write_latest_pointer(output: &Path) -> Result<()> {
    let step = output
        .file_name()
        .ok_or_else(|| {
            ConvertError::MalformedCheckpoint(format!(
                "output folder {} has no basename",
                output.display()
            ))
        })?
        .to_string_lossy()
        .into_owned();
    let parent = output.parent().ok_or_else(|| {
        ConvertError::MalformedCheckpoint(format!(
            "output folder {} has no parent",
            output.display()
        ))
    })?;
    let pointer = parent.join(LATEST_UNIVERSAL_FILE_NAME);
    fs::write(&pointer, &step)
        .with_context(|| format!("failed to write {}", pointer.display()))
}
