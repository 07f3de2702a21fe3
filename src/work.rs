//! The executable side of a job.
//!
//! A job's payload may carry a [`JobWork`]. When it does not, the scheduler
//! runs its default work, which is [`PlaceholderWork`] unless the builder
//! installs something else.

use crate::{Result, job::RuntimeJob};
use async_trait::async_trait;
use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

/// Work performed for one attempt of a job.
///
/// The job passed in is a copy of the runtime record taken at dispatch, with
/// `attempts` already counting this attempt. Returning `Err` fails the attempt;
/// the error's [`failure_reason`](crate::BatchworkError::failure_reason) is
/// recorded on the job.
#[async_trait]
pub trait JobWork: Send + Sync {
    async fn run(&self, job: RuntimeJob) -> Result<()>;
}

/// Sleeps briefly and succeeds.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderWork {
    delay: Duration,
}

impl PlaceholderWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for PlaceholderWork {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

#[async_trait]
impl JobWork for PlaceholderWork {
    async fn run(&self, _job: RuntimeJob) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

struct FnWork<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> JobWork for FnWork<F, Fut>
where
    F: Fn(RuntimeJob) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, job: RuntimeJob) -> Result<()> {
        (self.handler)(job).await
    }
}

/// Wrap an async closure as a [`JobWork`].
///
/// ```rust
/// use batchwork::{BatchworkError, work::work_fn};
///
/// let work = work_fn(|job| async move {
///     if job.attempts < 2 {
///         return Err(BatchworkError::Processing("warming up".to_string()));
///     }
///     Ok(())
/// });
/// # let _ = work;
/// ```
pub fn work_fn<F, Fut>(handler: F) -> Arc<dyn JobWork>
where
    F: Fn(RuntimeJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnWork {
        handler,
        _future: PhantomData,
    })
}
