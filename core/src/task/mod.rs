use async_trait::async_trait;
use batcher_errors::BatcherError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Task trait defining the core behavior for cancelable background tasks
///
/// This trait is implemented by any struct that needs to run as a background task.
/// The run_once method contains the main logic of the task.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Output: Send + Sync + 'static + Sized;

    /// Run the task once
    async fn run_once(&mut self) -> Result<Self::Output, BatcherError>;
}

/// Resolves once the owner asks the task to stop, either through the
/// returned sender (sending or dropping it) or through an external future.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl ShutdownSignal {
    pub fn new<Fut>(external: Fut) -> (Self, oneshot::Sender<()>)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let inner = async move {
            tokio::select! {
                _ = cancel_rx => {}
                _ = external => tracing::info!("External shutdown requested"),
            }
        }
        .boxed()
        .shared();

        (Self { inner }, cancel_tx)
    }

    /// A signal only the returned sender can trigger.
    pub fn manual() -> (Self, oneshot::Sender<()>) {
        Self::new(futures::future::pending())
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }

    pub async fn triggered(&self) {
        self.inner.clone().await
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// A task that runs another task on a fixed cadence
#[derive(Debug)]
pub struct WithDelay<T: Task> {
    /// The task to poll
    inner: T,
    /// The pause after each run
    poll_delay: Duration,
    /// Cuts the pause short
    signal: ShutdownSignal,
}

impl<T: Task> WithDelay<T> {
    pub fn new(inner: T, poll_delay: Duration, signal: ShutdownSignal) -> Self {
        Self {
            inner,
            poll_delay,
            signal,
        }
    }
}

#[async_trait]
impl<T: Task> Task for WithDelay<T> {
    type Output = T::Output;

    async fn run_once(&mut self) -> Result<T::Output, BatcherError> {
        let output = self.inner.run_once().await?;

        tokio::select! {
            _ = sleep(self.poll_delay) => {}
            _ = self.signal.triggered() => {}
        }

        Ok(output)
    }
}

/// A task that is skipped once its shutdown signal fired
#[derive(Debug)]
pub struct CancelableTask<T: Task> {
    /// The task to run
    inner: T,
    signal: ShutdownSignal,
}

impl<T: Task> CancelableTask<T> {
    pub fn new(inner: T, signal: ShutdownSignal) -> Self {
        Self { inner, signal }
    }
}

#[derive(Debug, Clone)]
pub enum CancelableResult<T> {
    Running(T),
    Cancelled,
}

#[async_trait]
impl<T: Task> Task for CancelableTask<T> {
    type Output = CancelableResult<T::Output>;

    async fn run_once(&mut self) -> Result<Self::Output, BatcherError> {
        // A run that already started is never interrupted
        if self.signal.is_triggered() {
            Ok(CancelableResult::Cancelled)
        } else {
            Ok(CancelableResult::Running(self.inner.run_once().await?))
        }
    }
}

#[derive(Debug)]
pub struct CancelableLoop<T: Task + Sized> {
    inner: CancelableTask<T>,
}

#[async_trait]
impl<T: Task + Sized> Task for CancelableLoop<T> {
    type Output = ();

    async fn run_once(&mut self) -> Result<Self::Output, BatcherError> {
        loop {
            match self.inner.run_once().await {
                Ok(CancelableResult::Running(_)) => {
                    continue;
                }
                Ok(CancelableResult::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

pub trait TaskExt: Task + Sized {
    fn into_cancelable(self, signal: ShutdownSignal) -> CancelableTask<Self>;

    fn into_loop(self, signal: ShutdownSignal) -> CancelableLoop<Self>;

    fn into_polling(self, poll_delay: Duration, signal: ShutdownSignal) -> WithDelay<Self>;

    fn into_bg(self) -> JoinHandle<Result<Self::Output, BatcherError>>;
}

impl<T: Task + Sized> TaskExt for T {
    fn into_cancelable(self, signal: ShutdownSignal) -> CancelableTask<Self> {
        CancelableTask::new(self, signal)
    }

    fn into_loop(self, signal: ShutdownSignal) -> CancelableLoop<Self> {
        CancelableLoop {
            inner: self.into_cancelable(signal),
        }
    }

    fn into_polling(self, poll_delay: Duration, signal: ShutdownSignal) -> WithDelay<Self> {
        WithDelay::new(self, poll_delay, signal)
    }

    fn into_bg(mut self) -> JoinHandle<Result<Self::Output, BatcherError>> {
        tokio::spawn(async move { self.run_once().await })
    }
}
