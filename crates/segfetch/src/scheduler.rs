//! Bounded fan-out of download tasks with fail-fast cancellation.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyScheduler {
    max_concurrency: usize,
    launch_delay: Duration,
}

impl ConcurrencyScheduler {
    pub fn new(max_concurrency: usize, launch_delay: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            launch_delay,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `worker` over `items` in FIFO order with at most
    /// `max_concurrency` in flight, pausing `launch_delay` between launches.
    ///
    /// Each worker gets a token linked to `token`. The first failure cancels
    /// that linked token, the remaining workers are drained and the original
    /// error is returned as is. A worker that gives up with
    /// [`DownloadError::Cancelled`] of its own accord stops its siblings the
    /// same way. Cancellation of `token` always yields
    /// [`DownloadError::Cancelled`]. Results come back in completion order.
    pub async fn run<I, T, F, Fut>(
        &self,
        items: impl IntoIterator<Item = I>,
        token: &CancellationToken,
        mut worker: F,
    ) -> Result<Vec<T>, DownloadError>
    where
        F: FnMut(I, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let linked = token.child_token();
        let mut queue: VecDeque<I> = items.into_iter().collect();
        let mut in_flight = FuturesUnordered::new();
        let mut results = Vec::with_capacity(queue.len());
        let mut first_error: Option<DownloadError> = None;
        let mut saw_cancellation = false;
        let mut next_launch = Instant::now();

        debug!(
            items = queue.len(),
            max_concurrency = self.max_concurrency,
            "Scheduling tasks"
        );

        loop {
            let can_launch = !linked.is_cancelled()
                && in_flight.len() < self.max_concurrency
                && !queue.is_empty();

            if can_launch && Instant::now() >= next_launch {
                if let Some(item) = queue.pop_front() {
                    in_flight.push(worker(item, linked.clone()));
                    next_launch = Instant::now() + self.launch_delay;
                    trace!(in_flight = in_flight.len(), queued = queue.len(), "Task launched");
                }
                continue;
            }

            if in_flight.is_empty() {
                if !can_launch {
                    break;
                }
                tokio::select! {
                    _ = linked.cancelled() => {}
                    _ = sleep_until(next_launch) => {}
                }
                continue;
            }

            tokio::select! {
                biased;
                Some(result) = in_flight.next() => match result {
                    Ok(value) => results.push(value),
                    Err(err) if err.is_cancelled() => {
                        if !saw_cancellation && !linked.is_cancelled() {
                            debug!("Task cancelled itself, cancelling siblings");
                            linked.cancel();
                        }
                        saw_cancellation = true;
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            debug!(error = %err, "Task failed, cancelling siblings");
                            linked.cancel();
                            first_error = Some(err);
                        } else {
                            trace!(error = %err, "Sibling failed after cancellation");
                        }
                    }
                },
                _ = sleep_until(next_launch), if can_launch => {}
            }
        }

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if saw_cancellation {
            return Err(DownloadError::Cancelled);
        }
        Ok(results)
    }
}
