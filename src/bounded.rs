//! concurrency-limited, order-preserving parallel map

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// default number of in-flight remote fetches
pub const DEFAULT_CONCURRENCY: usize = 24;

/// knobs shared by every item of one `map_limit` call
#[derive(Clone, Debug, Default)]
pub struct MapOptions {
    /// cooperative cancellation; unfinished items resolve to `Error::Cancelled`
    pub cancel: Option<CancellationToken>,
    /// upper bound for a single item, so a hung call cannot pin a slot forever
    pub timeout: Option<Duration>,
}

impl MapOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// map `f` over `items` with at most `limit` invocations in flight
///
/// `results[i]` always corresponds to `items[i]`, whatever the completion
/// order. a failing item does not stop the others: its error is returned in
/// its own slot and the caller decides how to report it.
pub async fn map_limit<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    options: &MapOptions,
    f: F,
) -> Vec<Result<R>>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let limit = limit.max(1);
    let f = &f;

    stream::iter(items.into_iter().enumerate())
        .map(|(idx, item)| run_one(idx, f(idx, item), options))
        .buffered(limit)
        .collect()
        .await
}

async fn run_one<R>(
    idx: usize,
    fut: impl Future<Output = Result<R>>,
    options: &MapOptions,
) -> Result<R> {
    let bounded = async {
        match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("item {} exceeded {:?}", idx, limit),
                }),
            },
            None => fut.await,
        }
    };

    match &options.cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = bounded => result,
            }
        }
        None => bounded.await,
    }
}
