use futures_util::future::join_all;
use std::future::Future;

/// Run `count` index-addressed calls with geometrically growing concurrency.
///
/// The first batch runs `initial_batch_size` calls at once. Each batch that
/// finishes cleanly doubles the next one (capped by what is left). A batch
/// with any failure is allowed to finish, then no further batch starts.
///
/// A batch's futures are polled concurrently on the calling task, not
/// spawned. The barrier between batches is the completion of `join_all`.
///
/// Returns the number of successful calls and the first error by index.
pub async fn slow_start_batch<F, Fut>(
    count: usize,
    initial_batch_size: usize,
    call: F,
) -> (usize, Option<anyhow::Error>)
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut successes = 0;
    let mut next_index = 0;
    let mut remaining = count;
    let mut batch_size = initial_batch_size.max(1).min(remaining);

    while batch_size > 0 {
        let results = join_all((next_index..next_index + batch_size).map(&call)).await;
        next_index += batch_size;
        remaining -= batch_size;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => successes += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if first_error.is_some() {
            return (successes, first_error);
        }

        batch_size = (batch_size * 2).min(remaining);
    }

    (successes, None)
}

/// Fold independent failures into one error. A single failure is returned
/// as is; several are rendered as `[e1, e2]`.
pub fn aggregate(mut errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Some(anyhow::anyhow!("[{}]", joined))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Groups call indices by how many calls had completed when they
    /// started; every call of one batch starts before any of them ends.
    struct Tracker {
        completed: AtomicUsize,
        started: Mutex<BTreeMap<usize, Vec<usize>>>,
    }

    impl Tracker {
        fn new() -> Self {
            Self {
                completed: AtomicUsize::new(0),
                started: Mutex::new(BTreeMap::new()),
            }
        }

        async fn run(&self, index: usize, fail: bool) -> anyhow::Result<()> {
            let done = self.completed.load(Ordering::SeqCst);
            self.started
                .lock()
                .unwrap()
                .entry(done)
                .or_default()
                .push(index);
            tokio::task::yield_now().await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            if fail {
                anyhow::bail!("call {} failed", index);
            }
            Ok(())
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.started
                .lock()
                .unwrap()
                .values()
                .map(|v| v.len())
                .collect()
        }
    }

    #[tokio::test]
    async fn batches_double_until_done() {
        let tracker = Tracker::new();
        let (ok, err) = slow_start_batch(10, 1, |i| tracker.run(i, false)).await;
        assert_eq!(ok, 10);
        assert!(err.is_none());
        assert_eq!(tracker.batch_sizes(), vec![1, 2, 4, 3]);
    }

    #[tokio::test]
    async fn failing_batch_finishes_then_stops() {
        let tracker = Tracker::new();
        // Index 4 sits in the third batch (indices 3..7).
        let (ok, err) = slow_start_batch(10, 1, |i| tracker.run(i, i == 4)).await;
        assert_eq!(ok, 1 + 2 + 3);
        assert_eq!(err.unwrap().to_string(), "call 4 failed");
        assert_eq!(tracker.batch_sizes(), vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn first_error_is_lowest_index() {
        let (ok, err) = slow_start_batch(3, 4, |i| async move {
            if i > 0 {
                anyhow::bail!("call {} failed", i);
            }
            Ok(())
        })
        .await;
        assert_eq!(ok, 1);
        assert_eq!(err.unwrap().to_string(), "call 1 failed");
    }

    #[tokio::test]
    async fn zero_calls_is_a_no_op() {
        let (ok, err) = slow_start_batch(0, 1, |_| async { Ok(()) }).await;
        assert_eq!(ok, 0);
        assert!(err.is_none());
    }

    #[test]
    fn aggregate_joins_messages() {
        assert!(aggregate(Vec::new()).is_none());
        let one = aggregate(vec![anyhow::anyhow!("a")]).unwrap();
        assert_eq!(one.to_string(), "a");
        let two = aggregate(vec![anyhow::anyhow!("a"), anyhow::anyhow!("b")]).unwrap();
        assert_eq!(two.to_string(), "[a, b]");
    }
}
