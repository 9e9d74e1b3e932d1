use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs one asynchronous operation per item with at most `concurrency`
/// operations in flight.
///
/// Operations are polled on the calling task. A failing item never aborts
/// the others, every item gets its own result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchRunner {
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns `(item, result)` pairs in the order the items were given.
    pub async fn run<I, T, E, F, Fut>(&self, items: Vec<I>, operation: F) -> Vec<(I, Result<T, E>)>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let operation = &operation;

        stream::iter(items)
            .map(|item| async move {
                let result = operation(item.clone()).await;
                (item, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

/// Splits batch results into successes and failures, keeping their order.
pub fn partition<I, T, E>(results: Vec<(I, Result<T, E>)>) -> (Vec<(I, T)>, Vec<(I, E)>) {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for (item, result) in results {
        match result {
            Ok(value) => succeeded.push((item, value)),
            Err(error) => failed.push((item, error)),
        }
    }

    (succeeded, failed)
}
