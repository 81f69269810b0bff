//! Retry-with-backoff combinator and cooperative cancellation.
//!
//! The engine never retries a failed commit on its own; callers opt in with [`with_retry`],
//! which by default retries only errors marked retryable ([`Error::is_retryable`], i.e.
//! concurrency conflicts).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::error::{DeltaResult, Error};

/// Cooperative cancellation signal. Cheap to clone; raising the paired [`AbortHandle`] makes
/// every holder observe the abort at its next suspension point.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Create a connected handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error out if the signal has been raised. Call at suspension points.
    pub fn check(&self) -> DeltaResult<()> {
        if self.is_aborted() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolve when the signal is raised; pend forever if the handle is dropped unraised.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Observability hook invoked before each backoff sleep with the failed attempt number
/// (1-based) and the error about to be retried.
pub type RetryHook = Box<dyn Fn(u32, &Error) + Send + Sync>;

pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized away: `delay * (1 ± jitter/2)`.
    pub jitter: f64,
    pub signal: Option<AbortSignal>,
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            signal: None,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryOptions {
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped - spread / 2.0 + rand::thread_rng().gen_range(0.0..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or exhausts
/// `opts.max_attempts`. The closure receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(opts: &RetryOptions, mut op: F) -> DeltaResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DeltaResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        if let Some(signal) = &opts.signal {
            signal.check()?;
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < opts.max_attempts => {
                if let Some(hook) = &opts.on_retry {
                    hook(attempt, &err);
                }
                let delay = opts.delay_for(attempt - 1);
                match &opts.signal {
                    Some(signal) => {
                        tokio::select! {
                            _ = signal.cancelled() => return Err(Error::Aborted),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_opts() -> RetryOptions {
        RetryOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retries_concurrency_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&fast_opts(), |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Concurrency {
                        expected: 0,
                        actual: 1,
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_validation_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = with_retry(&fast_opts(), |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::validation("bad"))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let opts = RetryOptions {
            max_attempts: 3,
            ..fast_opts()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let err = with_retry(&opts, |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Concurrency {
                    expected: 0,
                    actual: 1,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_short_circuits() {
        let (handle, signal) = abort_pair();
        handle.abort();
        let opts = fast_opts().with_signal(signal);
        let err = with_retry(&opts, |_| async { Ok::<_, Error>(1) })
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn hook_sees_each_failed_attempt() {
        let seen = Arc::new(AtomicU32::new(0));
        let hook_seen = seen.clone();
        let opts = RetryOptions {
            max_attempts: 3,
            ..fast_opts()
        }
        .with_hook(Box::new(move |attempt, err| {
            hook_seen.fetch_add(attempt, Ordering::SeqCst);
            assert!(err.is_concurrency());
        }));
        let _ = with_retry(&opts, |_| async {
            Err::<(), _>(Error::Concurrency {
                expected: 0,
                actual: 1,
            })
        })
        .await;
        // attempts 1 and 2 get a hook call; the final failure does not
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
