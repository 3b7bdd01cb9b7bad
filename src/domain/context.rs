//! Call Context
//!
//! Every remote provider call runs under a deadline and a cancellation
//! token. Child contexts share the parent's token tree, so cancelling a
//! request reaches every sub-task it spawned.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default deadline for a single remote provider call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request context carried into every adapter call
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Correlation id for logs and audit records
    pub request_id: String,
    /// Actor on whose behalf the request runs
    pub actor_id: Option<String>,
    /// Deadline applied to each individual remote call
    pub timeout: Duration,
    cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl CallContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            actor_id: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Derive a context for a sub-task. Cancelling `self` cancels the child;
    /// cancelling the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            actor_id: self.actor_id.clone(),
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one remote call under this context's deadline and cancellation.
    ///
    /// A deadline miss becomes `Unavailable`. Cancellation becomes `Unknown`
    /// whether it lands before dispatch or while the call is in flight.
    pub async fn run<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Unknown(format!(
                "{}: request cancelled before dispatch",
                operation
            )));
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(request_id = %self.request_id, operation, "call cancelled in flight");
                Err(Error::Unknown(format!(
                    "{}: cancelled while in flight, remote outcome unknown",
                    operation
                )))
            }
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Unavailable(format!(
                    "{}: timed out after {:?}",
                    operation, self.timeout
                ))),
            },
        }
    }
}
