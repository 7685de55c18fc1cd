//! Request Context
//!
//! Carries cancellation, an optional deadline and the operator name through
//! every suspension point of a transaction.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::LedgerError;

/// Operator recorded in the audit trail when none is supplied
pub const DEFAULT_OPERATOR: &str = "system";

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    operator: Option<String>,
}

impl Context {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        // A parent deadline is never extended
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Derived context cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            operator: self.operator.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn operator(&self) -> &str {
        self.operator.as_deref().unwrap_or(DEFAULT_OPERATOR)
    }

    /// Fails if the context is already cancelled or past its deadline
    pub fn check(&self) -> Result<(), LedgerError> {
        if self.cancel.is_cancelled() {
            return Err(LedgerError::Cancelled("context cancelled".to_string()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(LedgerError::Cancelled("deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the deadline.
    ///
    /// When the context wins, `fut` is dropped before it completes.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(LedgerError::Cancelled("context cancelled".to_string()))
            }
            _ = deadline => Err(LedgerError::Cancelled("deadline exceeded".to_string())),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_operator() {
        assert_eq!(Context::background().operator(), "system");
        assert_eq!(
            Context::background().with_operator("alice").operator(),
            "alice"
        );
    }

    #[tokio::test]
    async fn test_check_cancelled() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(LedgerError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.check().is_err());
    }

    #[tokio::test]
    async fn test_deadline_never_extended() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = Context::background();
        let res = ctx.guard(async { Ok::<_, LedgerError>(42) }).await;
        assert_eq!(res.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_guard_deadline_interrupts_pending_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let res: Result<(), LedgerError> = ctx
            .guard(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(LedgerError::Cancelled(msg)) if msg == "deadline exceeded"));
    }

    #[tokio::test]
    async fn test_guard_cancel_interrupts_pending_future() {
        let ctx = Context::background();
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res: Result<(), LedgerError> = ctx
            .guard(async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(LedgerError::Cancelled(_))));
    }
}
