//! CLI entry point for uckpt.
//!
//! Orchestrates the three conversion phases: shard extraction, TP merge, and
//! finalization. Phases never overlap; each reads what the previous one
//! wrote.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use uckpt::config::Config;
use uckpt::types::{TEMP_DIR_NAME, ZERO_DIR_NAME};
use uckpt::{extract, finalize, merge, SourceIndex};

/// Convert a 3D-parallel training checkpoint to a universal checkpoint.
#[derive(Parser, Debug)]
#[command(name = "uckpt")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input sharded checkpoint folder
    #[arg(long = "input_folder")]
    input_folder: PathBuf,

    /// Output universal checkpoint folder
    #[arg(long = "output_folder")]
    output_folder: PathBuf,

    /// How many parallel workers extract zero shards (0 = auto-detect)
    #[arg(long = "num_extract_workers", default_value = "4")]
    num_extract_workers: usize,

    /// How many parallel workers merge tp slices (more memory intensive,
    /// use fewer than extract workers; 0 = auto-detect)
    #[arg(long = "num_merge_workers", default_value = "2")]
    num_merge_workers: usize,

    /// Preserve the temporary folder of intermediate checkpoint slice
    /// files. Useful for debugging
    #[arg(long = "keep_temp_folder")]
    keep_temp_folder: bool,

    /// Be more chatty
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    debug!(?args, "parsed arguments");

    if !args.input_folder.exists() {
        bail!("input folder not found: {}", args.input_folder.display());
    }

    let config = Config {
        num_extract_workers: args.num_extract_workers,
        num_merge_workers: args.num_merge_workers,
        keep_temp_folder: args.keep_temp_folder,
    };

    info!(
        "converting checkpoint in {} to universal checkpoint in {}",
        args.input_folder.display(),
        args.output_folder.display()
    );

    let index = SourceIndex::open(&args.input_folder)?;
    let topology = index.topology();
    info!(
        %topology,
        iteration = index.iteration(),
        params = index.param_shapes().len(),
        "indexed source checkpoint"
    );

    fs::create_dir_all(&args.output_folder).with_context(|| {
        format!(
            "failed to create output folder {}",
            args.output_folder.display()
        )
    })?;
    let temp_dir = args.output_folder.join(TEMP_DIR_NAME);
    let zero_dir = args.output_folder.join(ZERO_DIR_NAME);

    info!("1. extracting zero shard fragments");
    extract::run(&index, &temp_dir, config.extract_workers())?;

    info!("2. merging tensor-parallel slices");
    merge::run(&index, &temp_dir, &zero_dir, config.merge_workers())?;

    info!("3. saving residual optimizer state");
    finalize::write_optimizer_state(&index, &zero_dir)?;

    if !config.keep_temp_folder {
        // Left in place on failure above; best-effort removal on success.
        if let Err(err) = fs::remove_dir_all(&temp_dir) {
            warn!(%err, "failed to remove temporary folder {}", temp_dir.display());
        }
    }

    let copied = finalize::copy_aux_files(&args.input_folder, &args.output_folder)?;
    debug!(copied, "copied auxiliary mp* files");

    finalize::write_latest_pointer(&args.output_folder)?;

    info!("done");
    Ok(())
}
