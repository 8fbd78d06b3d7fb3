//! Run configuration for the converter.

/// Default extraction worker count.
pub const DEFAULT_EXTRACT_WORKERS: usize = 4;

/// Default merge worker count. Merging is the memory-heavy phase: each
/// worker holds up to `3 * TP * numel(param)` elements at once, so the
/// default stays well below the extraction default.
pub const DEFAULT_MERGE_WORKERS: usize = 2;

/// Configuration of one conversion run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workers for the shard-extraction phase (0 = auto-detect).
    pub num_extract_workers: usize,
    /// Workers for the TP-merge phase (0 = auto-detect).
    pub num_merge_workers: usize,
    /// Preserve the intermediate `tmp/` tree after a successful run.
    pub keep_temp_folder: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_extract_workers: DEFAULT_EXTRACT_WORKERS,
            num_merge_workers: DEFAULT_MERGE_WORKERS,
            keep_temp_folder: false,
        }
    }
}

impl Config {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved extraction worker count.
    pub fn extract_workers(&self) -> usize {
        resolve_workers(self.num_extract_workers)
    }

    /// Resolved merge worker count.
    pub fn merge_workers(&self) -> usize {
        resolve_workers(self.num_merge_workers)
    }
}

fn resolve_workers(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}
