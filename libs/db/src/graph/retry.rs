//! Retry combinators and the dead-letter channel.
//!
//! Two shapes cover the commit and deleteAll paths: retry a failing body a
//! bounded number of times, or re-run a body until a predicate accepts its
//! result. Attempts are separated by a short randomized delay bounded by
//! `max_back_off_ms`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use super::model::Edge;

/// An element that exhausted its retries, handed to the outside world for
/// offline replay.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub label_id: u32,
    pub reason: String,
    pub edge: Option<Edge>,
}

/// Opaque producer handle of the dead-letter channel.
#[derive(Clone)]
pub struct DeadLetterQueue {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl DeadLetterQueue {
    /// Create the queue and the receiving end the embedder drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, letter: DeadLetter) {
        tracing::warn!(
            label_id = letter.label_id,
            reason = %letter.reason,
            "Dead-lettering element"
        );
        // The embedder may have dropped the receiver; losing the letter then
        // is its choice.
        let _ = self.sender.send(letter);
    }
}

/// Random delay in `1..=max_back_off_ms`.
pub async fn back_off(max_back_off_ms: u64) {
    if max_back_off_ms == 0 {
        return;
    }
    let delay = rand::thread_rng().gen_range(1..=max_back_off_ms);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// Run `body` up to `1 + max_retry` times, returning the first success.
/// After exhaustion returns `on_exhaust`.
pub async fn retry_on_failure<T, F, Fut>(
    max_retry: usize,
    max_back_off_ms: u64,
    mut body: F,
    on_exhaust: T,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    for attempt in 0..=max_retry {
        match body().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::debug!(attempt, err = %e, "Attempt failed");
                if attempt < max_retry {
                    back_off(max_back_off_ms).await;
                }
            }
        }
    }
    on_exhaust
}

/// Run `body` until `predicate` accepts its result, up to `1 + max_retry`
/// executions. An errored execution has no acceptable result and retries
/// like a rejected one. Returns the last result either way; the caller
/// re-applies the predicate to distinguish exhaustion.
pub async fn retry_on_success<T, F, Fut, P>(
    max_retry: usize,
    max_back_off_ms: u64,
    mut body: F,
    predicate: P,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    P: Fn(&T) -> bool,
{
    let mut last = body().await;
    for attempt in 0..max_retry {
        match &last {
            Ok(value) if predicate(value) => return last,
            Ok(_) => tracing::debug!(attempt, "Result rejected by predicate, retrying"),
            Err(e) => tracing::debug!(attempt, err = %e, "Attempt failed, retrying"),
        }
        back_off(max_back_off_ms).await;
        last = body().await;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_on_failure_eventually_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = retry_on_failure(
            5,
            0,
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient");
                    }
                    Ok(42)
                }
            },
            -1,
        )
        .await;
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_failure_exhausts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: i32 = retry_on_failure(
            2,
            0,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("always fails")
                }
            },
            -1,
        )
        .await;
        assert_eq!(result, -1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_success_predicate() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = retry_on_success(
            10,
            0,
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
            },
            |v| *v >= 3,
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_retry_on_success_returns_last_after_exhaustion() {
        let result = retry_on_success(2, 0, || async { Ok(0) }, |v| *v > 0)
            .await
            .unwrap();
        assert_eq!(result, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_queue_delivers() {
        let (queue, mut receiver) = DeadLetterQueue::channel();
        queue.enqueue(DeadLetter {
            label_id: 10,
            reason: "exhausted".to_string(),
            edge: None,
        });
        let letter = receiver.recv().await.unwrap();
        assert_eq!(letter.label_id, 10);
    }

    #[tokio::test]
    async fn test_dead_letter_queue_tolerates_dropped_receiver() {
        let (queue, receiver) = DeadLetterQueue::channel();
        drop(receiver);
        queue.enqueue(DeadLetter {
            label_id: 10,
            reason: "nobody listening".to_string(),
            edge: None,
        });
    }
}
