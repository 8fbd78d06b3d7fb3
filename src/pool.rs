//! Chunked worker-pool execution.
//!
//! Work items run on a dedicated thread pool in contiguous chunks of size
//! equal to the worker count, with a barrier between chunks. The pool is
//! never oversubscribed and the progress bar advances exactly once per
//! chunk, so progress reporting is deterministic. Task I/O domains are
//! disjoint by construction, so no coordination beyond the result funnel is
//! needed.

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};

/// Run `task` over every item, `workers` at a time.
///
/// The first failing task aborts the run once its chunk has drained; later
/// chunks never start.
pub fn run_chunked<T, F>(items: Vec<T>, workers: usize, label: &str, task: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Sync,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build worker pool")?;

    let total_chunks = items.len().div_ceil(workers);
    let bar = ProgressBar::new(total_chunks as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>8} [{bar:40.cyan/blue}] {pos}/{len} chunks ({elapsed})")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );
    bar.set_message(label.to_string());

    let mut remaining = items;
    while !remaining.is_empty() {
        let tail = remaining.split_off(remaining.len().min(workers));
        let chunk = std::mem::replace(&mut remaining, tail);
        let count = chunk.len();

        let (tx, rx) = bounded::<Result<()>>(count);
        let task = &task;
        pool.scope(|scope| {
            for item in chunk {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let _ = tx.send(task(item));
                });
            }
        });
        drop(tx);

        let mut first_err = None;
        for result in rx.iter().take(count) {
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            bar.abandon();
            return Err(err);
        }
        bar.inc(1);
    }
    bar.finish();
    Ok(())
}
