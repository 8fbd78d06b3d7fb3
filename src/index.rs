//! Source checkpoint discovery and indexing.
//!
//! Scans the input root for the iteration folder, derives the parallel
//! topology and the universal-metadata descriptor from the model rank files,
//! and hands out the per-rank file paths the extraction and merge phases
//! read. All accessors are read-only; the index never mutates the source.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::UniversalMetadata;
use crate::error::ConvertError;
use crate::store::{self, Value};
use crate::types::{
    Topology, CHECKPOINT_ARGS, DP_SIZE_ARG, ITERATION, MODEL_FILE_NAME, PARAM_SHAPES, PP_SIZE_ARG,
    TP_SIZE_ARG, UNIVERSAL_CHECKPOINT_INFO,
};

/// Index over one sharded source checkpoint.
#[derive(Debug)]
pub struct SourceIndex {
    root: PathBuf,
    iter_dir: PathBuf,
    iteration: u64,
    topology: Topology,
    param_shapes: IndexMap<String, Vec<usize>>,
    metadata: UniversalMetadata,
    model_files: Vec<PathBuf>,
}

impl SourceIndex {
    /// Open and validate the checkpoint under `root`.
    ///
    /// Fails fast when the universal-metadata descriptor is absent, when the
    /// schema is malformed, or when any rank file implied by the parsed
    /// topology is missing on disk.
    pub fn open(root: &Path) -> Result<Self> {
        let (iter_dir, iteration) = find_iteration_dir(root)?;

        let probe = probe_model_file(&iter_dir)?;
        let record = store::load(&probe)?;

        let args = record.require(CHECKPOINT_ARGS)?;
        let topology = Topology::new(
            parse_degree(args, PP_SIZE_ARG)?,
            parse_degree(args, TP_SIZE_ARG)?,
            parse_degree(args, DP_SIZE_ARG)?,
        );

        let iteration = match record.get(ITERATION) {
            Some(v) => v.expect_usize(ITERATION)? as u64,
            None => iteration,
        };

        let metadata_value = record.get(UNIVERSAL_CHECKPOINT_INFO).ok_or_else(|| {
            ConvertError::MissingUniversalMetadata {
                path: probe.clone(),
            }
        })?;
        let metadata = UniversalMetadata::from_value(metadata_value)?;

        // The manifest is the merge of param_shapes across every model rank
        // file: pipeline stages contribute disjoint names, TP duplicates
        // collapse onto the first occurrence.
        let mut param_shapes = IndexMap::new();
        let mut model_files = Vec::with_capacity(topology.pp * topology.tp);
        for (pp, tp) in topology.model_ranks() {
            let path = iter_dir
                .join(model_rank_dir(tp, pp, topology.pp))
                .join(MODEL_FILE_NAME);
            let record = store::load(&path)?;
            merge_param_shapes(&mut param_shapes, &record)?;
            model_files.push(path);
        }

        let index = SourceIndex {
            root: root.to_path_buf(),
            iter_dir,
            iteration,
            topology,
            param_shapes,
            metadata,
            model_files,
        };

        for (pp, tp, dp) in topology.ranks() {
            let path = index.optimizer_file(pp, tp, dp);
            if !path.is_file() {
                return Err(ConvertError::MalformedCheckpoint(format!(
                    "missing optimizer rank file {}",
                    path.display()
                ))
                .into());
            }
        }

        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Ordered parameter manifest: name to rank-local slice shape.
    pub fn param_shapes(&self) -> &IndexMap<String, Vec<usize>> {
        &self.param_shapes
    }

    pub fn metadata(&self) -> &UniversalMetadata {
        &self.metadata
    }

    pub fn model_files(&self) -> &[PathBuf] {
        &self.model_files
    }

    /// Path of the optimizer rank file for one `(pp, tp, dp)` triple.
    pub fn optimizer_file(&self, pp: usize, tp: usize, dp: usize) -> PathBuf {
        let name = if self.topology.pp == 1 {
            format!("zero_dp_rank_{dp:02}_mp_rank_{tp:02}_optim_states.pt")
        } else {
            format!("zero_dp_rank_{dp:02}_mp_rank_{tp:02}_{pp:03}_optim_states.pt")
        };
        self.iter_dir.join(name)
    }
}

/// Locate the iteration folder; the highest iteration wins when several exist.
fn find_iteration_dir(root: &Path) -> Result<(PathBuf, u64)> {
    let re = Regex::new(r"^iter_(\d+)$").context("failed to compile iteration folder pattern")?;
    let mut best: Option<(u64, PathBuf)> = None;
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to read input folder {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(caps) = re.captures(&name) else {
            continue;
        };
        let iteration: u64 = caps[1]
            .parse()
            .with_context(|| format!("iteration folder {name:?} out of range"))?;
        if best.as_ref().map_or(true, |(n, _)| iteration > *n) {
            best = Some((iteration, entry.path()));
        }
    }
    match best {
        Some((iteration, path)) => Ok((path, iteration)),
        None => Err(ConvertError::MalformedCheckpoint(format!(
            "no iter_* folder under {}",
            root.display()
        ))
        .into()),
    }
}

/// The first model rank file, used to bootstrap degrees and the descriptor.
fn probe_model_file(iter_dir: &Path) -> Result<PathBuf> {
    for dir in ["mp_rank_00", "mp_rank_00_000"] {
        let candidate = iter_dir.join(dir).join(MODEL_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(ConvertError::MalformedCheckpoint(format!(
        "no mp_rank_00 model file under {}",
        iter_dir.display()
    ))
    .into())
}

fn model_rank_dir(tp: usize, pp: usize, pp_degree: usize) -> String {
    if pp_degree == 1 {
        format!("mp_rank_{tp:02}")
    } else {
        format!("mp_rank_{tp:02}_{pp:03}")
    }
}

fn parse_degree(args: &Value, key: &str) -> Result<usize> {
    let degree = args.require(key)?.expect_usize(key)?;
    if degree == 0 {
        return Err(
            ConvertError::MalformedCheckpoint(format!("{key} must be positive")).into(),
        );
    }
    Ok(degree)
}

/// Fold one model rank file's `param_shapes` stages into the manifest.
fn merge_param_shapes(
    manifest: &mut IndexMap<String, Vec<usize>>,
    record: &Value,
) -> Result<()> {
    let stages = record.require(PARAM_SHAPES)?.expect_list(PARAM_SHAPES)?;
    for stage in stages {
        for (name, shape) in stage.expect_map("param_shapes stage")? {
            let shape = parse_shape(shape, name)?;
            if let Some(existing) = manifest.get(name) {
                if *existing != shape {
                    return Err(ConvertError::MalformedCheckpoint(format!(
                        "parameter {name} declared with shapes {existing:?} and {shape:?}"
                    ))
                    .into());
                }
            } else {
                manifest.insert(name.clone(), shape);
            }
        }
    }
    Ok(())
}

fn parse_shape(value: &Value, name: &str) -> Result<Vec<usize>> {
    let dims = value.expect_list("parameter shape")?;
    let mut shape = Vec::with_capacity(dims.len());
    for dim in dims {
        let dim = dim.expect_usize("shape dimension")?;
        if dim == 0 {
            return Err(ConvertError::MalformedCheckpoint(format!(
                "parameter {name} has a zero-sized dimension"
            ))
            .into());
        }
        shape.push(dim);
    }
    Ok(shape)
}
