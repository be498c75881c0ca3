//! Deadline and cancellation guarding
//!
//! An attempt is raced against an optional deadline and an optional
//! caller-owned [`CancellationToken`]. Either one firing drops the work
//! future, which is how the transport observes cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a guarded future did not run to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The deadline elapsed first
    TimedOut,
    /// The cancellation token fired first
    Cancelled,
}

/// Run `work` until it completes, the deadline passes, or `cancel` fires
///
/// Cancellation wins ties over the deadline, and both win over a result
/// that became ready in the same poll.
///
/// # Example
///
/// ```ignore
/// use everruns_fetch::reliability::{guarded, Interrupted};
///
/// let result = guarded(transport.send(request), Some(timeout), token.as_ref()).await;
/// match result {
///     Ok(response) => { /* attempt finished */ }
///     Err(Interrupted::TimedOut) => { /* deadline elapsed */ }
///     Err(Interrupted::Cancelled) => { /* caller cancelled */ }
/// }
/// ```
pub async fn guarded<F>(
    work: F,
    deadline: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    let timer = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(Interrupted::Cancelled),
        _ = timer => Err(Interrupted::TimedOut),
        output = work => Ok(output),
    }
}

/// Sleep for `delay` unless `cancel` fires first
pub async fn cancellable_sleep(
    delay: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), Interrupted> {
    if delay.is_zero() {
        return match cancel {
            Some(token) if token.is_cancelled() => Err(Interrupted::Cancelled),
            _ => Ok(()),
        };
    }
    guarded(tokio::time::sleep(delay), None, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_completes_before_deadline() {
        let result = guarded(async { 7 }, Some(Duration::from_secs(1)), None).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let started = tokio::time::Instant::now();
        let result = guarded(
            std::future::pending::<()>(),
            Some(Duration::from_millis(50)),
            None,
        )
        .await;

        assert_eq!(result, Err(Interrupted::TimedOut));
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fires_and_drops_work() {
        let token = CancellationToken::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let work = async move {
            let _flag = flag;
            std::future::pending::<()>().await
        };
        let result = guarded(work, Some(Duration::from_secs(10)), Some(&token)).await;

        assert_eq!(result, Err(Interrupted::Cancelled));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_already_cancelled_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let result = guarded(async { 1 }, None, Some(&token)).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep() {
        assert_eq!(cancellable_sleep(Duration::ZERO, None).await, Ok(()));
        assert_eq!(
            cancellable_sleep(Duration::from_millis(20), None).await,
            Ok(())
        );

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            cancellable_sleep(Duration::ZERO, Some(&token)).await,
            Err(Interrupted::Cancelled)
        );
    }
}
