//! Range fan-out with skip hints
//!
//! Path enumerations over the tree frequently discover that a whole aligned
//! block of indices is dead — a zero subtree, or a control mask nothing in
//! the block can satisfy. The drivers here honor that: the body returns how
//! many further indices to skip, and the loop advances past them without
//! invoking the body again.

use parking_lot::Mutex;
use rayon::prelude::*;

/// Minimum range before the parallel drivers fan out
const PARALLEL_THRESHOLD: u64 = 64;

/// Sequential skip-honoring driver
///
/// Calls `body(i)` for `i` in `[begin, end)`; a nonzero return advances the
/// loop past that many additional indices.
pub fn for_qbdt<F>(begin: u64, end: u64, mut body: F)
where
    F: FnMut(u64) -> u64,
{
    let mut i = begin;
    while i < end {
        let skip = body(i);
        i = i.saturating_add(1).saturating_add(skip);
    }
}

/// Parallel skip-honoring driver
///
/// Splits `[begin, end)` across the worker pool; each chunk runs the
/// sequential driver. `body(i, chunk)` receives the chunk index alongside
/// the iteration index and returns the skip hint.
pub fn par_for_qbdt<F>(begin: u64, end: u64, body: F)
where
    F: Fn(u64, usize) -> u64 + Sync,
{
    if end <= begin {
        return;
    }
    if end - begin < PARALLEL_THRESHOLD {
        for_qbdt(begin, end, |i| body(i, 0));
        return;
    }
    chunk_ranges(begin, end)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk, (lo, hi))| {
            for_qbdt(lo, hi, |i| body(i, chunk));
        });
}

/// Parallel skip-honoring reduction
///
/// Runs [`par_for_qbdt`] with one accumulator slot per chunk (the chunk
/// index keys the slot, so each lock is uncontended), then folds the slots.
pub fn par_reduce_qbdt<T, F>(begin: u64, end: u64, identity: T, body: F) -> T
where
    T: Send + Clone + std::ops::Add<Output = T>,
    F: Fn(u64) -> (T, u64) + Sync,
{
    if end <= begin {
        return identity;
    }
    if end - begin < PARALLEL_THRESHOLD {
        let mut acc = identity;
        for_qbdt(begin, end, |i| {
            let (value, skip) = body(i);
            acc = acc.clone() + value;
            skip
        });
        return acc;
    }
    let slot_count = chunk_ranges(begin, end).len();
    let slots: Vec<Mutex<T>> = (0..slot_count).map(|_| Mutex::new(identity.clone())).collect();
    par_for_qbdt(begin, end, |i, chunk| {
        let (value, skip) = body(i);
        let mut slot = slots[chunk].lock();
        *slot = slot.clone() + value;
        skip
    });
    slots
        .into_iter()
        .fold(identity, |acc, slot| acc + slot.into_inner())
}

/// Deterministic chunking of `[begin, end)` over the worker pool
fn chunk_ranges(begin: u64, end: u64) -> Vec<(u64, u64)> {
    let span = end - begin;
    let chunks = (rayon::current_num_threads() as u64 * 4).min(span).max(1);
    let step = span.div_ceil(chunks);
    (0..chunks)
        .map(|c| {
            let lo = begin + c * step;
            (lo.min(end), (lo + step).min(end))
        })
        .filter(|(lo, hi)| lo < hi)
        .collect()
}
