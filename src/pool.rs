use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// The one fan-out primitive: `count` workers drain a shared input channel,
/// and `post` runs exactly once after the last worker exits (conventionally
/// closing the output channel by dropping its sender).
///
/// Backpressure comes from the bounded input channel; there is no dynamic
/// resizing.
pub async fn work<T, W, Fut, P>(count: usize, input: mpsc::Receiver<T>, worker: W, post: P)
where
    T: Send + 'static,
    W: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    P: FnOnce(),
{
    let input = Arc::new(Mutex::new(input));

    let mut handles = Vec::with_capacity(count);
    for _ in 0..count.max(1) {
        let input = Arc::clone(&input);
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            loop {
                // the lock is held only while waiting for the next job, never
                // across the job itself
                let job = { input.lock().await.recv().await };
                match job {
                    Some(job) => worker(job).await,
                    None => break,
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    post();
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn all_jobs_are_processed_and_post_runs_once() {
        let (in_tx, in_rx) = mpsc::channel::<u64>(4);
        let (out_tx, mut out_rx) = mpsc::channel::<u64>(4);

        let post_calls = Arc::new(AtomicUsize::new(0));
        let post_counter = Arc::clone(&post_calls);

        let worker_tx = out_tx.clone();
        let pool = tokio::spawn(work(
            3,
            in_rx,
            move |job| {
                let tx = worker_tx.clone();
                async move {
                    let _ = tx.send(job * 2).await;
                }
            },
            move || {
                post_counter.fetch_add(1, Ordering::SeqCst);
                drop(out_tx);
            },
        ));

        for n in 0..10 {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);

        let mut results = Vec::new();
        while let Some(result) = out_rx.recv().await {
            results.push(result);
        }
        pool.await.unwrap();

        results.sort_unstable();
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(post_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_an_empty_input_still_runs_post() {
        let (in_tx, in_rx) = mpsc::channel::<()>(1);
        drop(in_tx);

        let post_calls = Arc::new(AtomicUsize::new(0));
        let post_counter = Arc::clone(&post_calls);
        work(2, in_rx, |_| async {}, move || {
            post_counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(post_calls.load(Ordering::SeqCst), 1);
    }
}
