//! Pool selection and mover start.
//!
//! Choosing a pool for a file is somebody else's decision. The door only
//! asks, with a bounded retry policy, and gets back the pool that started a
//! mover or a typed reason why none did.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use super::namespace::FileId;
use super::state::StateId;
use super::transfer::{IoMode, Subject};

/// Numeric return codes used by the pool side.
pub mod rc {
    pub const FILE_IN_CACHE: i32 = 210;
    pub const BROKEN_ON_TAPE: i32 = 243;
    pub const NO_POOL_CONFIGURED: i32 = 10011;
    pub const NO_POOL_ONLINE: i32 = 10012;
    pub const PERMISSION_DENIED: i32 = 10018;
    pub const TIMEOUT: i32 = 10006;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("file is being written elsewhere: {0}")]
    FileInCache(String),
    #[error("file is broken on tape: {0}")]
    BrokenOnTape(String),
    #[error("no pool configured: {0}")]
    NoPoolConfigured(String),
    #[error("no pool online: {0}")]
    NoPoolOnline(String),
    #[error("pool selection timed out")]
    Timeout,
    #[error("pool selection interrupted")]
    Interrupted,
    #[error("pool selection failed (rc={rc}): {message}")]
    Other { rc: i32, message: String },
}

impl SelectionError {
    pub fn from_rc(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            rc::PERMISSION_DENIED => Self::PermissionDenied(message),
            rc::FILE_IN_CACHE => Self::FileInCache(message),
            rc::BROKEN_ON_TAPE => Self::BrokenOnTape(message),
            rc::NO_POOL_CONFIGURED => Self::NoPoolConfigured(message),
            rc::NO_POOL_ONLINE => Self::NoPoolOnline(message),
            rc::TIMEOUT => Self::Timeout,
            _ => Self::Other { rc: code, message },
        }
    }

    /// Failures a later attempt may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoPoolOnline(_) | Self::Timeout | Self::Other { .. }
        )
    }
}

/// What the door asks the selection service for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub state_id: StateId,
    pub file: FileId,
    pub mode: IoMode,
    pub subject: Subject,
    pub client: SocketAddr,
    /// Mover queue on the pool, if the door is configured with one.
    pub io_queue: Option<String>,
    /// Cell name the pool reports readiness and completion to.
    pub door: String,
}

/// A mover that was started on `pool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverStart {
    pub pool: String,
    pub mover_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub retry_count: u32,
    pub retry_period: Duration,
    /// Overall deadline for all attempts.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_period: Duration, timeout: Duration) -> Self {
        Self {
            retry_count,
            retry_period,
            timeout,
        }
    }

    /// Run `attempt` until it succeeds, fails permanently, or the policy is
    /// exhausted. Each attempt gets the time left before the deadline.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, SelectionError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, SelectionError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;
        let mut last_error = SelectionError::Timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last_error);
            }

            attempts += 1;
            let err = match timeout(remaining, attempt(remaining)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => SelectionError::Timeout,
            };

            if !err.is_retryable() || attempts >= self.retry_count {
                return Err(err);
            }

            debug!(attempt = attempts, error = %err, "Pool selection failed, retrying");
            last_error = err;

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.retry_period.min(remaining)).await;
        }
    }
}

/// The external "pick a pool and start a mover" service.
#[async_trait]
pub trait PoolSelector: Send + Sync {
    async fn select_and_start(
        &self,
        request: &SelectionRequest,
        policy: &RetryPolicy,
    ) -> Result<MoverStart, SelectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn return_codes_map_to_causes() {
        assert!(matches!(
            SelectionError::from_rc(rc::NO_POOL_ONLINE, "x"),
            SelectionError::NoPoolOnline(_)
        ));
        assert!(matches!(
            SelectionError::from_rc(rc::BROKEN_ON_TAPE, "x"),
            SelectionError::BrokenOnTape(_)
        ));
        assert_eq!(
            SelectionError::from_rc(42, "odd"),
            SelectionError::Other {
                rc: 42,
                message: "odd".into()
            }
        );
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(5), Duration::from_secs(2));

        let c = calls.clone();
        let result = policy
            .run(|_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SelectionError::NoPoolOnline("busy".into()))
                    } else {
                        Ok(17)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(17));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(5), Duration::from_secs(2));

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run(|_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(SelectionError::PermissionDenied("no".into())) }
            })
            .await;

        assert!(matches!(result, Err(SelectionError::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_retry_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(2));

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run(|_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(SelectionError::NoPoolOnline("none".into())) }
            })
            .await;

        assert!(matches!(result, Err(SelectionError::NoPoolOnline(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_bounds_a_hanging_attempt() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_millis(10), Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result: Result<(), _> = policy
            .run(|_| async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(SelectionError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
