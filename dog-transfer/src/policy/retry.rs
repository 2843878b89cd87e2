use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;

use crate::config::jitter;
use crate::pipeline::{Policy, PolicyFactory, Request, Response};
use crate::{OpContext, RetryOptions, TransferError, TransferResult};

/// Which host a try was sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTarget {
    Primary,
    Secondary,
}

/// How the policy classified the outcome of a try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Response or non-retryable error handed back to the caller
    Done,
    /// The caller's context ended
    ContextDone,
    /// The secondary returned 404; later tries only use the primary
    SecondaryNotFound,
    /// The per-try deadline passed
    TryTimeout,
    /// Temporary or timeout network error
    NetworkError,
}

impl RetryDecision {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::SecondaryNotFound | Self::TryTimeout | Self::NetworkError
        )
    }
}

/// One try as reported to a [`RetryObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub try_number: u32,
    pub target: RetryTarget,
    /// Delay slept before this try
    pub delay: Duration,
    pub decision: RetryDecision,
    /// False on the last allowed try even when the decision was retryable
    pub will_retry: bool,
}

pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Retries transient failures with back-off, optionally alternating reads with a secondary host
#[derive(Clone)]
pub struct RetryPolicyFactory {
    options: RetryOptions,
    observer: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicyFactory")
            .field("options", &self.options)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryPolicyFactory {
    pub fn new(options: RetryOptions) -> TransferResult<Self> {
        Ok(Self {
            options: options.validated()?,
            observer: None,
        })
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

impl PolicyFactory for RetryPolicyFactory {
    fn create(&self, next: Arc<dyn Policy>) -> Arc<dyn Policy> {
        Arc::new(RetryPolicy {
            options: self.options.clone(),
            observer: self.observer.clone(),
            next,
        })
    }
}

pub struct RetryPolicy {
    options: RetryOptions,
    observer: Option<RetryObserver>,
    next: Arc<dyn Policy>,
}

impl RetryPolicy {
    fn classify(
        &self,
        ctx: &OpContext,
        try_ctx: &OpContext,
        target: RetryTarget,
        outcome: &TransferResult<Response>,
    ) -> RetryDecision {
        if ctx.is_done() {
            return RetryDecision::ContextDone;
        }
        if target == RetryTarget::Secondary && is_not_found(outcome) {
            return RetryDecision::SecondaryNotFound;
        }
        match outcome {
            Ok(_) => RetryDecision::Done,
            Err(TransferError::DeadlineExceeded) => RetryDecision::TryTimeout,
            Err(_) if matches!(try_ctx.err(), Some(TransferError::DeadlineExceeded)) => {
                RetryDecision::TryTimeout
            }
            Err(err) if err.is_retryable_network() => RetryDecision::NetworkError,
            Err(_) => RetryDecision::Done,
        }
    }
}

fn is_not_found(outcome: &TransferResult<Response>) -> bool {
    match outcome {
        Ok(response) => response.status == StatusCode::NOT_FOUND,
        Err(TransferError::Status { status, .. }) => *status == StatusCode::NOT_FOUND,
        Err(_) => false,
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(&self, ctx: &OpContext, request: Request) -> TransferResult<Response> {
        let secondary = self
            .options
            .retry_reads_from_secondary_host
            .as_deref()
            .filter(|_| request.is_read());
        let mut consider_secondary = secondary.is_some();
        let mut primary_try = 0u32;

        for try_number in 1..=self.options.max_tries {
            let target = if !consider_secondary || try_number % 2 == 1 {
                RetryTarget::Primary
            } else {
                RetryTarget::Secondary
            };

            let delay = match target {
                RetryTarget::Primary => {
                    primary_try += 1;
                    self.options.calc_delay(primary_try)
                }
                RetryTarget::Secondary => Duration::from_secs(1).mul_f64(jitter()),
            };
            ctx.sleep(delay).await?;

            let mut attempt = request.clone();
            if try_number > 1 {
                attempt.body.rewind();
            }
            if target == RetryTarget::Secondary {
                if let Some(host) = secondary {
                    attempt.url.set_host(Some(host)).map_err(|e| {
                        TransferError::invalid(format!("Invalid secondary host {host:?}: {e}"))
                    })?;
                }
            }

            let timeout = match ctx.remaining() {
                Some(remaining) => self.options.try_timeout.min(remaining),
                None => self.options.try_timeout,
            };
            attempt.set_query_param("timeout", &timeout.as_secs().to_string());
            attempt.timeout = Some(timeout);

            let try_ctx = ctx.with_timeout(timeout);
            let outcome = try_ctx.run(self.next.send(&try_ctx, attempt)).await;
            let decision = self.classify(ctx, &try_ctx, target, &outcome);
            if decision == RetryDecision::SecondaryNotFound {
                consider_secondary = false;
            }
            let will_retry = decision.is_retryable() && try_number < self.options.max_tries;

            tracing::debug!(
                target: "dog_transfer::retry",
                try_number,
                ?target,
                delay_ms = delay.as_millis() as u64,
                ?decision,
                will_retry,
                "retry policy try finished"
            );
            if let Some(observer) = &self.observer {
                observer(&RetryEvent {
                    try_number,
                    target,
                    delay,
                    decision,
                    will_retry,
                });
            }

            if !will_retry {
                return match outcome {
                    Ok(mut response) => {
                        response.retain(try_ctx.drop_guard());
                        Ok(response)
                    }
                    Err(err) => {
                        try_ctx.cancel();
                        Err(err)
                    }
                };
            }
            drop(outcome);
            try_ctx.cancel();
        }

        Err(TransferError::invalid("max_tries must be at least 1"))
    }
}
