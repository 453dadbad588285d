//! Cancellable wait context passed to `schedule`.

use crate::error::ScheduleError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline bounding a scheduling wait.
///
/// Clones share the same token, so cancelling any clone cancels all waits using it.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a child of a shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Fail waits once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fail waits once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Err` if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), ScheduleError> {
        if self.token.is_cancelled() {
            return Err(ScheduleError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(ScheduleError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Race `fut` against cancellation and the deadline. Cancellation wins ties.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ScheduleError>
    where
        F: Future,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScheduleError::Cancelled),
            _ = deadline => Err(ScheduleError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
