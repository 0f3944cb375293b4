//! Per-call cancellation and deadline propagation.
//!
//! Every storage call and role lookup receives the caller's [`Context`]. The
//! engine checks it between steps, and backend I/O races against it, so a
//! cancelled request stops at the next await point with
//! [`StorageError::Cancelled`] (or [`StorageError::DeadlineExceeded`]) as the
//! error cause.

use std::future::Future;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Bind the context to a cancellation token owned by the caller.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Tighten the deadline to `timeout` from now. An earlier deadline is kept.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    ///
    /// # Errors
    /// Returns `Cancelled` or `DeadlineExceeded`.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(StorageError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    ///
    /// # Errors
    /// Returns the error of `fut`, or `Cancelled` / `DeadlineExceeded`.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StorageError::Cancelled),
            () = deadline => Err(StorageError::DeadlineExceeded),
            out = fut => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_runs_to_completion() {
        let ctx = Context::background();
        let out = ctx.run(async { Ok::<_, StorageError>(7) }).await;
        assert!(matches!(out, Ok(7)));
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_polling() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());
        token.cancel();

        assert!(matches!(ctx.check(), Err(StorageError::Cancelled)));
        let out = ctx.run(async { Ok::<_, StorageError>(()) }).await;
        assert!(matches!(out, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_work() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let out = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, StorageError>(())
            })
            .await;
        assert!(matches!(out, Err(StorageError::Cancelled)));
        let _ = canceller.await;
    }

    #[tokio::test]
    async fn deadline_interrupts_slow_work() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let out = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, StorageError>(())
            })
            .await;
        assert!(matches!(out, Err(StorageError::DeadlineExceeded)));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
