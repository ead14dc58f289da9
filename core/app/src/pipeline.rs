//! Pipeline runner: computes use cases in the background and delivers their
//! results in order on a completion context.

use futures::stream::{BoxStream, StreamExt};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waypoint_common::{Error, Result};

/// A unit of asynchronous work producing a stream of results.
///
/// One-shot use cases yield a single item; reactive ones keep yielding as
/// the underlying data changes.
pub trait UseCase: Send + Sync + 'static {
    type Output: Send + 'static;

    fn build(&self) -> BoxStream<'static, Result<Self::Output>>;
}

/// Receives the results of an executed use case.
pub trait Observer<T>: Send + 'static {
    fn on_next(&mut self, value: T);

    fn on_error(&mut self, error: Error) {
        warn!("Unhandled use case error: {}", error);
    }

    fn on_completed(&mut self) {}
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(Error) + Send>;
type CompletedFn = Box<dyn FnMut() + Send>;

/// An [`Observer`] assembled from closures.
pub struct Callbacks<T> {
    next: NextFn<T>,
    error: Option<ErrorFn>,
    completed: Option<CompletedFn>,
}

impl<T> Callbacks<T> {
    pub fn new(on_next: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            next: Box::new(on_next),
            error: None,
            completed: None,
        }
    }

    pub fn on_error(mut self, f: impl FnMut(Error) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.completed = Some(Box::new(f));
        self
    }
}

impl<T: Send + 'static> Observer<T> for Callbacks<T> {
    fn on_next(&mut self, value: T) {
        (self.next)(value)
    }

    fn on_error(&mut self, error: Error) {
        match &mut self.error {
            Some(f) => f(error),
            None => warn!("Unhandled use case error: {}", error),
        }
    }

    fn on_completed(&mut self) {
        if let Some(f) = &mut self.completed {
            f()
        }
    }
}

/// Where use case work is computed.
#[derive(Clone)]
pub struct BackgroundContext {
    runtime: runtime::Handle,
}

impl BackgroundContext {
    pub fn new(runtime: runtime::Handle) -> Self {
        Self { runtime }
    }

    /// The runtime of the caller.
    ///
    /// # Errors
    /// - `InvalidInput` when called outside a tokio runtime
    pub fn current() -> Result<Self> {
        runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::InvalidInput(format!("No tokio runtime: {}", e)))
    }

    pub fn runtime(&self) -> &runtime::Handle {
        &self.runtime
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Where results are delivered.
///
/// A single task runs delivery jobs one at a time in submission order, so
/// callbacks never run concurrently with each other.
#[derive(Clone)]
pub struct CompletionContext {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CompletionContext {
    /// Start a delivery task on `runtime`.
    pub fn spawn(runtime: &runtime::Handle) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("Completion context closed");
        });
        Self { jobs }
    }

    /// Queue `job`. Returns `false` once the delivery task is gone.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.jobs.send(Box::new(job)).is_ok()
    }
}

/// Cancels one execution of a use case.
#[derive(Debug, Clone)]
pub struct Handle {
    token: CancellationToken,
}

impl Handle {
    /// Stop delivering results. Idempotent, and harmless after completion.
    ///
    /// Work already committed by the use case is not undone.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs one kind of use case, with at most one active execution.
///
/// Executing again cancels the previous execution first, so results for
/// stale parameters are never delivered after the new execution starts.
/// Dropping the pipeline cancels its active execution.
pub struct Pipeline<U: UseCase> {
    background: BackgroundContext,
    completion: CompletionContext,
    current: Mutex<Option<Handle>>,
    _marker: PhantomData<fn(U)>,
}

impl<U: UseCase> Pipeline<U> {
    pub fn new(background: BackgroundContext, completion: CompletionContext) -> Self {
        Self {
            background,
            completion,
            current: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Start `use_case`, delivering its results to `observer`.
    pub fn execute(&self, use_case: U, observer: impl Observer<U::Output>) -> Handle {
        let handle = Handle {
            token: CancellationToken::new(),
        };

        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(handle.clone()) {
                previous.cancel();
            }
        }

        let delivery = Delivery {
            completion: self.completion.clone(),
            token: handle.token.clone(),
            observer: Arc::new(Mutex::new(observer)),
        };
        let runtime = self.background.runtime.clone();
        self.background.runtime.spawn(async move {
            if delivery.token.is_cancelled() {
                return;
            }
            // Building a reactive use case runs its first query.
            match runtime.spawn_blocking(move || use_case.build()).await {
                Ok(stream) => Self::drive(stream, delivery).await,
                Err(e) => {
                    warn!("Use case setup failed: {}", e);
                    delivery.send(move |o| {
                        o.on_error(Error::Persistence(format!("Use case setup failed: {}", e)))
                    });
                }
            }
        });

        handle
    }

    /// Cancel the active execution, if any.
    pub fn cancel(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(handle) = current.take() {
                handle.cancel();
            }
        }
    }

    async fn drive<O: Observer<U::Output>>(
        mut stream: BoxStream<'static, Result<U::Output>>,
        delivery: Delivery<O>,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                _ = delivery.token.cancelled() => return,
                item = stream.next() => item,
            };

            let delivered = match item {
                Some(Ok(value)) => delivery.send(move |o| o.on_next(value)),
                Some(Err(error)) => {
                    delivery.send(move |o| o.on_error(error));
                    return;
                }
                None => {
                    delivery.send(|o| o.on_completed());
                    return;
                }
            };

            if !delivered {
                return;
            }
        }
    }

    /// Run `use_case` on the caller's task and collect every result.
    ///
    /// Only meaningful for use cases whose stream ends. Stops at the first
    /// error.
    pub async fn run_to_completion(use_case: &U) -> Result<Vec<U::Output>> {
        let mut stream = use_case.build();
        let mut results = Vec::new();
        while let Some(item) = stream.next().await {
            results.push(item?);
        }
        Ok(results)
    }

    /// Run `use_case` on the caller's task and return its first result.
    pub async fn first(use_case: &U) -> Result<Option<U::Output>> {
        use_case.build().next().await.transpose()
    }
}

impl<U: UseCase> Drop for Pipeline<U> {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Delivery<O> {
    completion: CompletionContext,
    token: CancellationToken,
    observer: Arc<Mutex<O>>,
}

impl<O: Send + 'static> Delivery<O> {
    /// Queue a callback. It is skipped if the execution is cancelled by the
    /// time it runs.
    fn send(&self, f: impl FnOnce(&mut O) + Send + 'static) -> bool {
        let token = self.token.clone();
        let observer = self.observer.clone();
        self.completion.dispatch(move || {
            if token.is_cancelled() {
                return;
            }
            if let Ok(mut observer) = observer.lock() {
                f(&mut *observer);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Emits `values`, then optionally an error.
    struct Emit {
        values: Vec<u32>,
        fail: bool,
    }

    impl UseCase for Emit {
        type Output = u32;

        fn build(&self) -> BoxStream<'static, Result<u32>> {
            let mut items: Vec<Result<u32>> = self.values.iter().copied().map(Ok).collect();
            if self.fail {
                items.push(Err(Error::Network("down".to_string())));
            }
            stream::iter(items).boxed()
        }
    }

    /// Never ends; emits its seed once.
    struct Forever(u32);

    impl UseCase for Forever {
        type Output = u32;

        fn build(&self) -> BoxStream<'static, Result<u32>> {
            stream::once(futures::future::ready(Ok(self.0)))
                .chain(stream::pending())
                .boxed()
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Next(u32),
        Error,
        Completed,
    }

    fn recorder() -> (Callbacks<u32>, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let next_tx = tx.clone();
        let error_tx = tx.clone();
        let callbacks = Callbacks::new(move |v| {
            let _ = next_tx.send(Event::Next(v));
        })
        .on_error(move |_| {
            let _ = error_tx.send(Event::Error);
        })
        .on_completed(move || {
            let _ = tx.send(Event::Completed);
        });
        (callbacks, rx)
    }

    fn pipeline<U: UseCase>() -> Pipeline<U> {
        let runtime = runtime::Handle::current();
        Pipeline::new(
            BackgroundContext::new(runtime.clone()),
            CompletionContext::spawn(&runtime),
        )
    }

    async fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_delivers_in_order_then_completes() {
        let pipeline = pipeline::<Emit>();
        let (observer, mut rx) = recorder();

        pipeline.execute(
            Emit {
                values: vec![1, 2, 3],
                fail: false,
            },
            observer,
        );

        assert_eq!(
            drain(&mut rx).await,
            vec![Event::Next(1), Event::Next(2), Event::Next(3), Event::Completed]
        );
    }

    #[tokio::test]
    async fn test_error_ends_execution() {
        let pipeline = pipeline::<Emit>();
        let (observer, mut rx) = recorder();

        pipeline.execute(
            Emit {
                values: vec![7],
                fail: true,
            },
            observer,
        );

        assert_eq!(drain(&mut rx).await, vec![Event::Next(7), Event::Error]);
    }

    #[tokio::test]
    async fn test_rearm_cancels_previous() {
        let pipeline = pipeline::<Forever>();
        let (first_observer, mut first_rx) = recorder();
        let (second_observer, mut second_rx) = recorder();

        let first = pipeline.execute(Forever(1), first_observer);
        assert_eq!(first_rx.recv().await, Some(Event::Next(1)));

        let second = pipeline.execute(Forever(2), second_observer);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        assert_eq!(drain(&mut second_rx).await, vec![Event::Next(2)]);
        // Cancelled executions get neither an error nor a completion.
        assert!(drain(&mut first_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_delivery_delivers_nothing() {
        let pipeline = pipeline::<Emit>();
        let (observer, mut rx) = recorder();

        let handle = pipeline.execute(
            Emit {
                values: vec![1, 2],
                fail: true,
            },
            observer,
        );
        handle.cancel();
        handle.cancel();

        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_harmless() {
        let pipeline = pipeline::<Emit>();
        let (observer, mut rx) = recorder();

        let handle = pipeline.execute(
            Emit {
                values: vec![5],
                fail: false,
            },
            observer,
        );
        assert_eq!(drain(&mut rx).await, vec![Event::Next(5), Event::Completed]);

        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_cancels_active_execution() {
        let pipeline = pipeline::<Forever>();
        let (observer, mut rx) = recorder();

        let handle = pipeline.execute(Forever(3), observer);
        assert_eq!(rx.recv().await, Some(Event::Next(3)));

        drop(pipeline);
        assert!(handle.is_cancelled());
    }

    /// Emits the thread its stream was built on.
    struct BuiltOn;

    impl UseCase for BuiltOn {
        type Output = std::thread::ThreadId;

        fn build(&self) -> BoxStream<'static, Result<std::thread::ThreadId>> {
            let id = std::thread::current().id();
            stream::once(futures::future::ready(Ok(id))).boxed()
        }
    }

    #[tokio::test]
    async fn test_build_runs_off_calling_thread() {
        let pipeline = pipeline::<BuiltOn>();
        let (tx, mut rx) = mpsc::unbounded_channel();

        pipeline.execute(
            BuiltOn,
            Callbacks::new(move |id| {
                let _ = tx.send(id);
            }),
        );

        let built_on = rx.recv().await.unwrap();
        assert_ne!(built_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_run_to_completion_and_first() {
        let use_case = Emit {
            values: vec![4, 5],
            fail: false,
        };
        assert_eq!(
            Pipeline::<Emit>::run_to_completion(&use_case).await.unwrap(),
            vec![4, 5]
        );
        assert_eq!(Pipeline::<Emit>::first(&use_case).await.unwrap(), Some(4));

        let failing = Emit {
            values: vec![],
            fail: true,
        };
        assert!(Pipeline::<Emit>::run_to_completion(&failing).await.is_err());
    }
}
