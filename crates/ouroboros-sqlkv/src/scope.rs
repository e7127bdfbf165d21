//! Scope options and the guard that drives scope work.
//!
//! Work runs under three watchers: a panic catcher, an optional
//! cancellation token and an optional deadline. Whichever finishes first
//! decides the outcome. The deadline is fixed when the scope starts, so the
//! wait for the write lock and the work itself share one budget.
//!
//! An abandoned scope returns at once. SQLite cannot interrupt a statement
//! that is sleeping in its busy handler, so such a statement keeps its
//! connection for at most the configured busy timeout; the rollback runs on
//! that connection right after it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{KvError, Result};

/// Options for one transaction scope.
///
/// # Examples
///
/// ```rust,ignore
/// let token = CancellationToken::new();
/// let options = ScopeOptions::new()
///     .deadline(Duration::from_secs(2))
///     .cancel_on(token.clone());
/// store.run_scoped_with(options, |tx| Box::pin(async move {
///     tx.string("counter").incr(1).await
/// })).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    /// Abort and roll back once the scope has run this long, lock wait included.
    pub deadline: Option<Duration>,
    /// Abort and roll back when this token is cancelled.
    pub cancel: Option<CancellationToken>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the cancellation token.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Starts the clock for one scope.
    pub(crate) fn watch(&self) -> ScopeWatch<'_> {
        ScopeWatch {
            cancel: self.cancel.as_ref(),
            deadline: self.deadline.map(|d| (Instant::now() + d, d)),
        }
    }
}

/// Cancellation token and absolute deadline of a running scope.
#[derive(Debug)]
pub(crate) struct ScopeWatch<'a> {
    cancel: Option<&'a CancellationToken>,
    deadline: Option<(Instant, Duration)>,
}

impl ScopeWatch<'_> {
    /// Resolves with the abort reason once the token fires or the deadline
    /// passes. A pending cancellation wins over an expired deadline.
    async fn tripped(&self) -> KvError {
        let cancelled = async {
            match self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let expired = async {
            match self.deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancelled => {
                warn!("Transaction scope cancelled");
                KvError::Cancelled
            }
            _ = expired => {
                let budget = self.deadline.map(|(_, d)| d).unwrap_or_default();
                warn!(deadline_ms = budget.as_millis() as u64, "Transaction scope exceeded deadline");
                KvError::DeadlineExceeded(budget)
            }
        }
    }
}

/// Runs `work` to completion unless it panics, the token fires or the
/// deadline passes. An abort that is already due wins over work that is
/// ready. `work` is first polled inside the panic catcher, so a panic while
/// building it is captured too.
pub(crate) async fn drive<T, F>(work: F, watch: &ScopeWatch<'_>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guarded = AssertUnwindSafe(work).catch_unwind();

    tokio::select! {
        biased;

        err = watch.tripped() => Err(err),
        outcome = guarded => match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "Transaction scope recovered from panic");
                Err(KvError::Panicked(message))
            }
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
