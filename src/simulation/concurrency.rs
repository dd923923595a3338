use rayon::prelude::*;

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

/// Runs `f` once for every worker index below `num_workers`. Workers are
/// batched into `group_count` groups of `group_size` consecutive indices; each
/// group is one rayon task and runs its workers in index order. Returns when
/// every group has finished.
pub fn dispatch_workgroups<F: Fn(usize) + Send + Sync>(
    group_count: usize,
    group_size: usize,
    num_workers: usize,
    f: F,
) {
    (0..group_count).into_par_iter().for_each(|group_id| {
        let start = group_id * group_size;
        let end = usize::min(start + group_size, num_workers);
        for idx in start..end {
            f(idx);
        }
    });
}

#[test]
fn every_worker_runs_exactly_once() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let num_workers = 1000;
    let group_size = 128;
    let counters: Vec<AtomicU32> = (0..num_workers).map(|_| AtomicU32::new(0)).collect();

    dispatch_workgroups(
        crate::simulation_parameters::group_count(num_workers, group_size),
        group_size,
        num_workers,
        |i| {
            counters[i].fetch_add(1, Ordering::Relaxed);
        },
    );

    assert!(counters.iter().all(|c| c.load(Ordering::Relaxed) == 1));
}
