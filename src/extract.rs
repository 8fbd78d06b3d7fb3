//! Phase 1: split flat optimizer shards into per-parameter fragments.
//!
//! Each `(pp, tp, dp)` optimizer rank file holds three flat tensors per
//! parameter group; the group's slice mapping locates every parameter's
//! fragment inside them. Fragments land in the intermediate tree at
//! `tmp/<name>/<tp>/<moment>.<dp>` with the DP index zero-padded so a plain
//! lexicographic sort recovers DP order at merge time. Distinct work items
//! write disjoint path sets, so extraction needs no cross-worker
//! coordination.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConvertError;
use crate::index::SourceIndex;
use crate::pool;
use crate::store::{self, Value};
use crate::tensor::Tensor;
use crate::types::{
    FragmentSlice, Moment, BASE_OPTIMIZER_STATE, FRAGMENT_NUMEL, FRAGMENT_START,
    OPTIMIZER_STATE_DICT, PARAM_SLICE_MAPPINGS, SINGLE_PARTITION_OF_FP32_GROUPS, STATE,
};

/// Extract every rank's fragments into `temp_dir` using `workers` workers.
pub fn run(index: &SourceIndex, temp_dir: &Path, workers: usize) -> Result<()> {
    pool::run_chunked(
        index.topology().ranks(),
        workers,
        "extract",
        |(pp, tp, dp)| {
            extract_rank(index, temp_dir, pp, tp, dp).with_context(|| {
                format!("failed to extract shard pp={pp} tp={tp} dp={dp}")
            })
        },
    )
}

/// Split one optimizer rank file into per-parameter fragment files.
pub fn extract_rank(
    index: &SourceIndex,
    temp_dir: &Path,
    pp: usize,
    tp: usize,
    dp: usize,
) -> Result<()> {
    let path = index.optimizer_file(pp, tp, dp);
    debug!(pp, tp, dp, path = %path.display(), "extracting zero shard");

    let record = store::load(&path)?;
    let optim = record.require(OPTIMIZER_STATE_DICT)?;
    let state_groups = optim
        .require(BASE_OPTIMIZER_STATE)?
        .require(STATE)?
        .expect_list("base optimizer state groups")?;
    let fp32_groups = optim
        .require(SINGLE_PARTITION_OF_FP32_GROUPS)?
        .expect_list("fp32 partitions")?;
    let mapping_groups = optim
        .require(PARAM_SLICE_MAPPINGS)?
        .expect_list("param slice mappings")?;

    if state_groups.len() != fp32_groups.len() || state_groups.len() != mapping_groups.len() {
        return Err(ConvertError::MalformedCheckpoint(format!(
            "group counts disagree: {} state, {} fp32, {} mappings",
            state_groups.len(),
            fp32_groups.len(),
            mapping_groups.len()
        ))
        .into());
    }

    for (group, (state, fp32)) in mapping_groups
        .iter()
        .zip(state_groups.iter().zip(fp32_groups))
    {
        let flat_state = [
            (Moment::Fp32, fp32.expect_tensor("fp32 partition")?),
            (
                Moment::ExpAvg,
                state.require(Moment::ExpAvg.as_str())?.expect_tensor("exp_avg")?,
            ),
            (
                Moment::ExpAvgSq,
                state
                    .require(Moment::ExpAvgSq.as_str())?
                    .expect_tensor("exp_avg_sq")?,
            ),
        ];

        for (name, fragment) in group.expect_map("slice mapping group")? {
            // Tied weights are persisted by the first pipeline stage only.
            if pp > 0 && index.metadata().is_pipeline_replicated(name) {
                continue;
            }
            let fragment = parse_fragment(fragment)?;
            for (moment, flat) in &flat_state {
                if fragment.start + fragment.numel > flat.numel() {
                    return Err(ConvertError::FragmentOutOfBounds {
                        name: name.clone(),
                        moment: moment.as_str(),
                        start: fragment.start,
                        numel: fragment.numel,
                        len: flat.numel(),
                    }
                    .into());
                }
                let piece = flat.narrow(fragment.start, fragment.numel)?;
                store::save(
                    &fragment_path(temp_dir, name, tp, *moment, dp),
                    &Value::Tensor(piece),
                )?;
            }
        }
    }
    Ok(())
}

/// Intermediate path of one fragment: `tmp/<name>/<tp>/<moment>.<dp>`.
pub fn fragment_path(
    temp_dir: &Path,
    name: &str,
    tp: usize,
    moment: Moment,
    dp: usize,
) -> PathBuf {
    temp_dir
        .join(name)
        .join(tp.to_string())
        .join(format!("{}.{:02}", moment.as_str(), dp))
}

fn parse_fragment(value: &Value) -> Result<FragmentSlice> {
    Ok(FragmentSlice {
        start: value.require(FRAGMENT_START)?.expect_usize(FRAGMENT_START)?,
        numel: value.require(FRAGMENT_NUMEL)?.expect_usize(FRAGMENT_NUMEL)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SourceIndex;
    use crate::testutil::{moment_values, slice_values, Fixture};
    use crate::types::Topology;

    fn extract_all(index: &SourceIndex, temp_dir: &Path) {
        for (pp, tp, dp) in index.topology().ranks() {
            extract_rank(index, temp_dir, pp, tp, dp).unwrap();
        }
    }

    fn load_fragment(path: &Path) -> Tensor {
        store::load(path).unwrap().into_tensor("fragment").unwrap()
    }

    #[test]
    fn test_fragments_cover_each_slice() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::new(1, 2, 2);
        Fixture::new(topo)
            .stage(vec![vec![
                ("embed".to_string(), vec![10, 4]),
                ("bias".to_string(), vec![6]),
            ]])
            .write(dir.path())
            .unwrap();

        let index = SourceIndex::open(dir.path()).unwrap();
        let temp = dir.path().join("tmp");
        extract_all(&index, &temp);

        for name in ["embed", "bias"] {
            let numel: usize = index.param_shapes()[name].iter().product();
            for tp in 0..topo.tp {
                for moment in Moment::ALL {
                    let mut recovered = Vec::new();
                    for dp in 0..topo.dp {
                        let path = fragment_path(&temp, name, tp, moment, dp);
                        recovered.extend_from_slice(load_fragment(&path).data());
                    }
                    let expected = moment_values(moment, &slice_values(name, tp, numel));
                    assert_eq!(recovered, expected, "{name} {moment} tp={tp}");
                }
            }
        }
    }

    #[test]
    fn test_pipeline_replicated_skipped_past_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::new(2, 1, 1);
        Fixture::new(topo)
            .stage(vec![vec![("tied_embed".to_string(), vec![8])]])
            .stage(vec![vec![
                ("tied_embed".to_string(), vec![8]),
                ("head.weight".to_string(), vec![4]),
            ]])
            .pipeline_replicated(vec!["tied_embed".to_string()])
            .write(dir.path())
            .unwrap();

        let index = SourceIndex::open(dir.path()).unwrap();
        let temp = dir.path().join("tmp");
        extract_all(&index, &temp);

        // Exactly one DP fragment per moment: the pp=0 contribution.
        let tied_dir = temp.join("tied_embed").join("0");
        let count = std::fs::read_dir(&tied_dir).unwrap().count();
        assert_eq!(count, 3);
        let fragment = load_fragment(&fragment_path(&temp, "tied_embed", 0, Moment::Fp32, 0));
        assert_eq!(fragment.data(), slice_values("tied_embed", 0, 8));

        // The second stage's own parameter still extracted.
        assert!(fragment_path(&temp, "head.weight", 0, Moment::Fp32, 0).is_file());
    }

    #[test]
    fn test_fragment_paths_zero_pad_dp() {
        let temp = Path::new("/t");
        let path = fragment_path(temp, "w", 1, Moment::ExpAvg, 7);
        assert_eq!(path, Path::new("/t/w/1/exp_avg.07"));
    }

    #[test]
    fn test_out_of_bounds_fragment_is_fatal() {
        use indexmap::IndexMap;

        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::new(1, 1, 1);
        Fixture::new(topo)
            .stage(vec![vec![("w".to_string(), vec![4])]])
            .write(dir.path())
            .unwrap();
        let index = SourceIndex::open(dir.path()).unwrap();

        // Corrupt the slice mapping to point past the flat tensor.
        let path = index.optimizer_file(0, 0, 0);
        let record = store::load(&path).unwrap();
        let mut root = record.as_map().unwrap().clone();
        let mut optim = root[OPTIMIZER_STATE_DICT].as_map().unwrap().clone();
        let mut frag = IndexMap::new();
        frag.insert(FRAGMENT_START.to_string(), Value::Int(2));
        frag.insert(FRAGMENT_NUMEL.to_string(), Value::Int(3));
        let mut mapping = IndexMap::new();
        mapping.insert("w".to_string(), Value::Map(frag));
        optim.insert(
            PARAM_SLICE_MAPPINGS.to_string(),
            Value::List(vec![Value::Map(mapping)]),
        );
        root.insert(OPTIMIZER_STATE_DICT.to_string(), Value::Map(optim));
        store::save(&path, &Value::Map(root)).unwrap();

        let err = extract_rank(&index, &dir.path().join("tmp"), 0, 0, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::FragmentOutOfBounds { .. })
        ));
    }
}
