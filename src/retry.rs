use anyhow::{Error, Result};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bitcoin_client;

pub fn new_backoff() -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_jitter()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
}

pub fn new_backoff_limited(max_times: usize) -> ExponentialBuilder {
    new_backoff().with_max_times(max_times)
}

/// Polls until `timeout` worth of sleeps has elapsed, however many attempts
/// that takes.
pub fn new_sync_backoff(timeout: Duration) -> ExponentialBuilder {
    new_backoff()
        .with_max_delay(Duration::from_secs(2))
        .without_max_times()
        .with_total_delay(Some(timeout))
}

pub fn notify<E: std::fmt::Debug>(action: &str) -> impl FnMut(&E, Duration) {
    move |e, d| {
        warn!("Retrying {} due to {:?} after {:?}", action, e, d);
    }
}

pub fn retryable<E>(cancel_token: CancellationToken) -> impl FnMut(&E) -> bool {
    move |_| !cancel_token.is_cancelled()
}

pub async fn retry<T, E, F, Fut>(
    operation: F,
    action: &str,
    backoff: ExponentialBuilder,
    cancel_token: CancellationToken,
) -> Result<T>
where
    E: std::fmt::Debug + Into<Error>,
    Fut: Future<Output = Result<T, E>>,
    F: FnMut() -> Fut,
{
    operation
        .retry(&backoff)
        .notify(notify(action))
        .when(retryable(cancel_token))
        .await
        .map_err(Into::into)
}

/// Retries a ledger call only while it fails with a transient error and the
/// token is not cancelled. Rejections and other errors return at once.
pub async fn retry_transient<T, F, Fut>(
    operation: F,
    action: &str,
    backoff: &ExponentialBuilder,
    cancel_token: CancellationToken,
) -> Result<T, bitcoin_client::Error>
where
    Fut: Future<Output = Result<T, bitcoin_client::Error>>,
    F: FnMut() -> Fut,
{
    let mut keep_going = retryable(cancel_token);
    operation
        .retry(backoff)
        .notify(notify(action))
        .when(move |e: &bitcoin_client::Error| e.is_transient() && keep_going(e))
        .await
}
