//! Synthetic sharded checkpoints for tests.
//!
//! `Fixture` writes a complete source checkpoint tree: one model rank file
//! per `(pp, tp)` and one optimizer rank file per `(pp, tp, dp)`, with each
//! group's flat tensors partitioned contiguously across DP so parameters may
//! straddle DP boundaries like they do in real shards.

use anyhow::Result;
use indexmap::IndexMap;
use std::path::Path;

use crate::store::{self, Value};
use crate::tensor::Tensor;
use crate::types::{
    Moment, Topology, BASE_OPTIMIZER_STATE, CHECKPOINT_ARGS, DP_SIZE_ARG, FRAGMENT_NUMEL,
    FRAGMENT_START, ITERATION, MODEL_FILE_NAME, OPTIMIZER_STATE_DICT, ORIGINAL_VOCAB_SIZE,
    PARAM_GROUPS, PARAM_SHAPES, PARAM_SLICE_MAPPINGS, PIPELINE_REPLICATED_PARAMETER_PATTERNS,
    PP_SIZE_ARG, SINGLE_PARTITION_OF_FP32_GROUPS, STATE, TP_SIZE_ARG, UNIVERSAL_CHECKPOINT_INFO,
};

/// Parameters of one group: `(name, tp-local shape)` pairs.
pub(crate) type Group = Vec<(String, Vec<usize>)>;

pub(crate) struct Fixture {
    topology: Topology,
    stages: Vec<Vec<Group>>,
    info: Option<Value>,
    iteration: u64,
    tp_invariant: Vec<String>,
}

impl Fixture {
    pub fn new(topology: Topology) -> Self {
        Fixture {
            topology,
            stages: Vec::new(),
            info: Some(Value::Map(IndexMap::new())),
            iteration: 100,
            tp_invariant: Vec::new(),
        }
    }

    /// Append one pipeline stage's parameter groups.
    pub fn stage(mut self, groups: Vec<Group>) -> Self {
        self.stages.push(groups);
        self
    }

    pub fn iteration(mut self, iteration: u64) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn universal_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    pub fn without_universal_info(mut self) -> Self {
        self.info = None;
        self
    }

    pub fn pipeline_replicated(mut self, names: Vec<String>) -> Self {
        if let Some(Value::Map(map)) = &mut self.info {
            map.insert(
                PIPELINE_REPLICATED_PARAMETER_PATTERNS.to_string(),
                Value::List(names.into_iter().map(|n| Value::Str(n)).collect()),
            );
        }
        self
    }

    /// Mark parameters whose slice data is identical on every TP rank.
    pub fn tp_invariant(mut self, names: Vec<String>) -> Self {
        self.tp_invariant = names;
        self
    }

    pub fn write(&self, root: &Path) -> Result<()> {
        assert_eq!(
            self.stages.len(),
            self.topology.pp,
            "fixture needs one stage per pipeline rank"
        );
        let iter_dir = root.join(format!("iter_{:07}", self.iteration));
        for (pp, tp) in self.topology.model_ranks() {
            self.write_model_file(&iter_dir, pp, tp)?;
        }
        for (pp, tp, dp) in self.topology.ranks() {
            self.write_optimizer_file(&iter_dir, pp, tp, dp)?;
        }
        Ok(())
    }

    fn model_dir(&self, tp: usize, pp: usize) -> String {
        if self.topology.pp == 1 {
            format!("mp_rank_{tp:02}")
        } else {
            format!("mp_rank_{tp:02}_{pp:03}")
        }
    }

    fn optimizer_name(&self, tp: usize, pp: usize, dp: usize) -> String {
        if self.topology.pp == 1 {
            format!("zero_dp_rank_{dp:02}_mp_rank_{tp:02}_optim_states.pt")
        } else {
            format!("zero_dp_rank_{dp:02}_mp_rank_{tp:02}_{pp:03}_optim_states.pt")
        }
    }

    fn write_model_file(&self, iter_dir: &Path, pp: usize, tp: usize) -> Result<()> {
        let mut args = IndexMap::new();
        args.insert(TP_SIZE_ARG.to_string(), Value::Int(self.topology.tp as i64));
        args.insert(PP_SIZE_ARG.to_string(), Value::Int(self.topology.pp as i64));
        args.insert(DP_SIZE_ARG.to_string(), Value::Int(self.topology.dp as i64));

        let mut stage_shapes = IndexMap::new();
        for group in &self.stages[pp] {
            for (name, shape) in group {
                stage_shapes.insert(
                    name.clone(),
                    Value::List(shape.iter().map(|d| Value::Int(*d as i64)).collect()),
                );
            }
        }

        let mut record = IndexMap::new();
        record.insert(CHECKPOINT_ARGS.to_string(), Value::Map(args));
        record.insert(ITERATION.to_string(), Value::Int(self.iteration as i64));
        record.insert(
            PARAM_SHAPES.to_string(),
            Value::List(vec![Value::Map(stage_shapes)]),
        );
        if let Some(info) = &self.info {
            record.insert(UNIVERSAL_CHECKPOINT_INFO.to_string(), info.clone());
        }

        let path = iter_dir.join(self.model_dir(tp, pp)).join(MODEL_FILE_NAME);
        store::save(&path, &Value::Map(record))
    }

    fn write_optimizer_file(&self, iter_dir: &Path, pp: usize, tp: usize, dp: usize) -> Result<()> {
        let mut state_groups = Vec::new();
        let mut fp32_groups = Vec::new();
        let mut mapping_groups = Vec::new();
        let mut hyper_groups = Vec::new();

        for group in &self.stages[pp] {
            // Build the group's global flat buffer, then take this DP rank's
            // contiguous partition of it.
            let mut global = Vec::new();
            let mut ranges = Vec::new();
            for (name, shape) in group {
                let numel: usize = shape.iter().product();
                let start = global.len();
                global.extend(self.values_for(name, tp, numel));
                ranges.push((name.clone(), start, numel));
            }
            let (d0, d1) = partition(global.len(), self.topology.dp, dp);

            let mut mapping = IndexMap::new();
            for (name, start, numel) in &ranges {
                let lo = (*start).max(d0);
                let hi = (start + numel).min(d1);
                if lo >= hi {
                    continue;
                }
                let mut frag = IndexMap::new();
                frag.insert(FRAGMENT_START.to_string(), Value::Int((lo - d0) as i64));
                frag.insert(FRAGMENT_NUMEL.to_string(), Value::Int((hi - lo) as i64));
                mapping.insert(name.clone(), Value::Map(frag));
            }

            let local = &global[d0..d1];
            let fp32 = Tensor::from_vec(local.to_vec(), &[local.len()])?;
            let exp_avg =
                Tensor::from_vec(local.iter().map(|v| v * 0.5).collect(), &[local.len()])?;
            let exp_avg_sq =
                Tensor::from_vec(local.iter().map(|v| v * 0.25).collect(), &[local.len()])?;

            let mut state = IndexMap::new();
            state.insert(Moment::ExpAvg.as_str().to_string(), Value::Tensor(exp_avg));
            state.insert(
                Moment::ExpAvgSq.as_str().to_string(),
                Value::Tensor(exp_avg_sq),
            );
            state_groups.push(Value::Map(state));
            fp32_groups.push(Value::Tensor(fp32));
            mapping_groups.push(Value::Map(mapping));

            let mut hyper = IndexMap::new();
            hyper.insert("lr".to_string(), Value::Float(1e-4));
            hyper.insert("betas".to_string(), Value::List(vec![
                Value::Float(0.9),
                Value::Float(0.999),
            ]));
            hyper_groups.push(Value::Map(hyper));
        }

        let mut base = IndexMap::new();
        base.insert(STATE.to_string(), Value::List(state_groups));
        base.insert(PARAM_GROUPS.to_string(), Value::List(hyper_groups));

        let mut optim = IndexMap::new();
        optim.insert(BASE_OPTIMIZER_STATE.to_string(), Value::Map(base));
        optim.insert(
            SINGLE_PARTITION_OF_FP32_GROUPS.to_string(),
            Value::List(fp32_groups),
        );
        optim.insert(
            PARAM_SLICE_MAPPINGS.to_string(),
            Value::List(mapping_groups),
        );
        optim.insert("loss_scale".to_string(), Value::Float(65536.0));
        optim.insert("overflow".to_string(), Value::Bool(false));

        let mut record = IndexMap::new();
        record.insert(OPTIMIZER_STATE_DICT.to_string(), Value::Map(optim));

        let path = iter_dir.join(self.optimizer_name(tp, pp, dp));
        store::save(&path, &Value::Map(record))
    }

    fn values_for(&self, name: &str, tp: usize, numel: usize) -> Vec<f32> {
        let tp = if self.tp_invariant.iter().any(|n| n == name) {
            0
        } else {
            tp
        };
        slice_values(name, tp, numel)
    }
}

/// Deterministic fp32 slice for `(name, tp)`; exact under f32 so the derived
/// moments (`* 0.5`, `* 0.25`) are bitwise-reproducible.
pub(crate) fn slice_values(name: &str, tp: usize, numel: usize) -> Vec<f32> {
    let seed: usize = name.bytes().map(|b| b as usize).sum::<usize>() % 997;
    (0..numel)
        .map(|i| (seed + tp * 1000 + i) as f32)
        .collect()
}

/// The expected values of one moment given the fp32 slice values.
pub(crate) fn moment_values(moment: Moment, fp32: &[f32]) -> Vec<f32> {
    let scale = match moment {
        Moment::Fp32 => 1.0,
        Moment::ExpAvg => 0.5,
        Moment::ExpAvgSq => 0.25,
    };
    fp32.iter().map(|v| v * scale).collect()
}

/// Contiguous DP partition of `total` elements: `[start, end)` for rank `dp`.
pub(crate) fn partition(total: usize, dp_degree: usize, dp: usize) -> (usize, usize) {
    let base = total / dp_degree;
    let rem = total % dp_degree;
    let start = dp * base + dp.min(rem);
    let len = base + usize::from(dp < rem);
    (start, start + len)
}

/// Build a descriptor record from `(key, patterns)` pairs.
pub(crate) fn info_with_patterns(entries: &[(&str, &[&str])], vocab_size: usize) -> Value {
    let mut map = IndexMap::new();
    for (key, patterns) in entries {
        map.insert(
            key.to_string(),
            Value::List(patterns.iter().map(|p| Value::from(*p)).collect()),
        );
    }
    map.insert(
        ORIGINAL_VOCAB_SIZE.to_string(),
        Value::Int(vocab_size as i64),
    );
    Value::Map(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_everything() {
        let total = 11;
        let mut covered = 0;
        let mut prev_end = 0;
        for dp in 0..3 {
            let (start, end) = partition(total, 3, dp);
            assert_eq!(start, prev_end);
            covered += end - start;
            prev_end = end;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn test_slice_values_depend_on_tp() {
        let a = slice_values("w", 0, 4);
        let b = slice_values("w", 1, 4);
        assert_ne!(a, b);
        assert_eq!(a, slice_values("w", 0, 4));
    }
}
