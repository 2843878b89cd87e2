use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{TransferError, TransferResult};

/// Cancellation and deadline scope threaded through every network call.
///
/// Children inherit the parent's cancellation and never outlive its deadline:
/// a derived deadline is always `min(parent, local)`.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context with no deadline that is only done when cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an existing cancellation token (e.g. a service shutdown token)
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A cancellable child scope with the same deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope that ends at `deadline` or at the parent's deadline, whichever is first
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// A child scope that ends after `timeout` (bounded by the parent's deadline)
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why this scope is done, if it is. Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<TransferError> {
        if self.token.is_cancelled() {
            return Some(TransferError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(TransferError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the scope is cancelled or its deadline passes
    pub async fn done(&self) -> TransferError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => TransferError::Canceled,
                _ = tokio::time::sleep_until(deadline) => TransferError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                TransferError::Canceled
            }
        }
    }

    /// Drive `fut` to completion unless the scope ends first
    pub async fn run<F, T>(&self, fut: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            result = fut => result,
            err = self.done() => Err(err),
        }
    }

    /// Sleep for `duration`, returning early with the context error if the scope ends
    pub async fn sleep(&self, duration: Duration) -> TransferResult<()> {
        if duration.is_zero() {
            return match self.err() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// A guard that cancels this scope when dropped
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
