//! Bounded fan-out of per-VM operations.
//!
//! Every dispatched item runs to completion before a call returns; there is
//! no cancellation. Results come back in completion order, so operations
//! should return something that identifies their item (usually the vmid).

use crate::error::{Error, Result};
use rayon::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Run `operation` on every item with at most `workers` in flight and
/// collect every outcome, successful or not.
pub fn run_settled<I, T, F>(items: &[I], workers: usize, operation: F) -> Result<Vec<Result<T>>>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> Result<T> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let results: Arc<Mutex<Vec<Result<T>>>> = Arc::new(Mutex::new(Vec::with_capacity(items.len())));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| Error::Other(format!("failed to create worker pool: {e}")))?;

    log::info!("running {} operation(s) on {} worker(s)", items.len(), workers.max(1));
    pool.install(|| {
        items.par_iter().for_each(|item| {
            let result = operation(item);
            push_result(&results, result);
        });
    });

    let collected = into_results(results)?;
    log::info!(
        "{} operation(s) finished in {:.1}s",
        collected.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(collected)
}

/// Like [`run_settled`], but fail with the first error once every item has
/// finished.
pub fn run<I, T, F>(items: &[I], workers: usize, operation: F) -> Result<Vec<T>>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> Result<T> + Sync,
{
    run_settled(items, workers, operation)?.into_iter().collect()
}

fn push_result<T>(results: &Arc<Mutex<Vec<Result<T>>>>, result: Result<T>) {
    match results.lock() {
        Ok(mut locked) => locked.push(result),
        Err(poisoned) => poisoned.into_inner().push(result),
    }
}

fn into_results<T>(results: Arc<Mutex<Vec<Result<T>>>>) -> Result<Vec<Result<T>>> {
    let mutex = Arc::try_unwrap(results)
        .map_err(|_| Error::Other("failed to collect results: shared result state".to_string()))?;

    match mutex.into_inner() {
        Ok(collected) => Ok(collected),
        Err(poisoned) => Ok(poisoned.into_inner()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_run_settled_collects_all() {
        let items: Vec<u32> = (0..20).collect();
        let results = run_settled(&items, 4, |n| {
            if n % 5 == 0 {
                Err(Error::Other(format!("item {n}")))
            } else {
                Ok(*n)
            }
        })
        .unwrap();

        assert_eq!(results.len(), 20);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 4);
    }

    #[test]
    fn test_run_waits_for_siblings_before_failing() {
        let finished = AtomicUsize::new(0);
        let items = vec![0_u64, 30, 30, 30];

        let result = run(&items, 4, |delay| {
            if *delay == 0 {
                return Err(Error::Other("fast failure".into()));
            }
            thread::sleep(Duration::from_millis(*delay));
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_results_in_completion_order() {
        let items = vec![(1_u32, 60_u64), (2, 1)];
        let results = run(&items, 2, |(id, delay)| {
            thread::sleep(Duration::from_millis(*delay));
            Ok(*id)
        })
        .unwrap();
        assert_eq!(results, vec![2, 1]);
    }

    #[test]
    fn test_worker_bound_is_respected() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<u32> = (0..12).collect();

        run(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_empty_input() {
        let items: Vec<u32> = Vec::new();
        assert!(run(&items, 10, |n| Ok(*n)).unwrap().is_empty());
    }
}
