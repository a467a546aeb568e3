// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simple facilities for polling on a condition until it becomes true
//!
//! Racks process requests on their own tasks, so a test that triggers a
//! timer or a cascade and then wants to observe the outcome polls for it
//! rather than sleeping for a fixed time.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of one attempt to check a condition
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true yet
    NotYet,
    /// stop polling because we've encountered a non-retryable error
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

/// Error returned by [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E: std::error::Error + Send + Sync + 'static> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// `poll_max` has elapsed
///
/// `cond` is invoked every `poll_interval`. It returns `Ok(O)` once the
/// condition holds, `Err(CondCheckError::NotYet)` to keep polling, or
/// `Err(CondCheckError::Failed(E))` to stop immediately.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = AtomicUsize::new(0);
        let n = wait_for_condition::<_, Boom, _, _>(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok(n)
                }
            },
            &Duration::from_millis(1),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_polling() {
        let calls = AtomicUsize::new(0);
        let res = wait_for_condition::<(), _, _, _>(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CondCheckError::Failed(Boom))
            },
            &Duration::from_millis(1),
            &Duration::from_secs(10),
        )
        .await;
        assert!(matches!(res, Err(Error::PermanentError(Boom))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_times_out() {
        let res = wait_for_condition::<(), Boom, _, _>(
            || async { Err(CondCheckError::NotYet) },
            &Duration::from_millis(1),
            &Duration::from_millis(20),
        )
        .await;
        assert!(matches!(res, Err(Error::TimedOut(_))));
    }
}
