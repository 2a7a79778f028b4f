//! The process-wide cooperative parallel-for primitive every kernel
//! built on top of more than one thread goes through.
//!
//! `parallel_for` bounds fan-out with a global worker cap and an
//! anti-nesting guard: the first call to enter while the depth counter
//! is zero gets to spawn real threads; any call made while one is
//! already in flight (e.g. a `MatMul` invoked from inside another
//! `MatMul`'s worker) just runs its body sequentially on the calling
//! thread. This is what keeps a nested kernel from causing N² thread
//! creation.

use std::sync::atomic::{AtomicUsize, Ordering};

static MAX_WORKERS: AtomicUsize = AtomicUsize::new(0);
static DEPTH: AtomicUsize = AtomicUsize::new(0);

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The current worker cap, lazily initialized to the number of logical
/// CPUs on first read.
pub fn get_max_workers() -> usize {
    let current = MAX_WORKERS.load(Ordering::Relaxed);
    if current != 0 {
        return current;
    }
    let computed = default_workers().max(1);
    // Racing initializers converge on the same computed value, so a
    // plain store (rather than compare-exchange) is sufficient.
    MAX_WORKERS.store(computed, Ordering::Relaxed);
    computed
}

/// Overrides the worker cap. Takes effect for any `parallel_for` call
/// made after this returns, on any thread.
pub fn set_max_workers(n: usize) {
    MAX_WORKERS.store(n.max(1), Ordering::Relaxed);
}

/// Splits `[0, total)` into disjoint half-open ranges, each at least
/// `min_grain` wide (except possibly the last), and runs `body(start,
/// end)` once per range.
///
/// Runs `body` sequentially on the calling thread, with no worker
/// spawned, when `total <= min_grain`, when the worker cap is `<= 1`,
/// or when this call is nested inside another `parallel_for` already
/// in flight. Otherwise spawns up to `get_max_workers()` scoped
/// threads and blocks until all of them finish. No ordering is
/// guaranteed between concurrent invocations of `body`.
pub fn parallel_for<F>(total: usize, min_grain: usize, body: F)
where
    F: Fn(usize, usize) + Sync,
{
    if total == 0 {
        return;
    }
    let min_grain = min_grain.max(1);
    let workers = get_max_workers();

    if total <= min_grain || workers <= 1 {
        body(0, total);
        return;
    }

    let prior_depth = DEPTH.fetch_add(1, Ordering::SeqCst);
    if prior_depth > 0 {
        // Already inside a parallel_for: run sequentially and undo our
        // increment without having actually entered.
        DEPTH.fetch_sub(1, Ordering::SeqCst);
        body(0, total);
        return;
    }

    let chunk_count = ((total + min_grain - 1) / min_grain).min(workers).max(1);
    let base_chunk = total / chunk_count;
    let remainder = total % chunk_count;

    let mut ranges = Vec::with_capacity(chunk_count);
    let mut start = 0usize;
    for i in 0..chunk_count {
        let extra = if i < remainder { 1 } else { 0 };
        let end = (start + base_chunk + extra).min(total);
        if start < end {
            ranges.push((start, end));
        }
        start = end;
    }

    let body_ref = &body;
    crossbeam::scope(|scope| {
        for (start, end) in ranges {
            scope.spawn(move |_| body_ref(start, end));
        }
    })
    .expect("parallel_for: a worker thread panicked");

    DEPTH.fetch_sub(1, Ordering::SeqCst);
}
