use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tonic::Status;
use tracing::trace;

use crate::error::{BridgeError, catch_setup};

/// Receives the outcome of a [`Single`]: exactly one of a value or a failure.
pub trait SingleObserver<T>: Send + Sync {
    fn on_success(&self, value: T);
    fn on_error(&self, status: Status);
}

/// Delivers at most one signal to a [`SingleObserver`]. Clones share the same "done" flag, so
/// whichever clone signals first wins and every later signal is dropped.
pub struct SingleEmitter<T> {
    observer: Arc<dyn SingleObserver<T>>,
    done: Arc<AtomicBool>,
}

impl<T> Clone for SingleEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            observer: Arc::clone(&self.observer),
            done: Arc::clone(&self.done),
        }
    }
}

impl<T> SingleEmitter<T> {
    fn new(observer: Arc<dyn SingleObserver<T>>) -> Self {
        Self {
            observer,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn on_success(&self, value: T) {
        if self.done.swap(true, Ordering::AcqRel) {
            trace!("Dropping value emitted after terminal signal");
            return;
        }
        self.observer.on_success(value);
    }

    pub fn on_error(&self, status: Status) {
        if self.done.swap(true, Ordering::AcqRel) {
            trace!(status = %status, "Dropping error emitted after terminal signal");
            return;
        }
        self.observer.on_error(status);
    }

    /// Whether a signal has already been delivered.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

type OnSubscribe<T> = dyn Fn(SingleEmitter<T>) + Send + Sync;

/// A deferred computation that produces one value or fails.
///
/// Nothing happens until [`subscribe`](Single::subscribe); each subscription runs the
/// computation again with a fresh [`SingleEmitter`].
pub struct Single<T> {
    on_subscribe: Arc<OnSubscribe<T>>,
}

impl<T> Clone for Single<T> {
    fn clone(&self) -> Self {
        Self {
            on_subscribe: Arc::clone(&self.on_subscribe),
        }
    }
}

impl<T: Send + 'static> Single<T> {
    /// Build a single from a function that receives the emitter of each subscription.
    pub fn create(on_subscribe: impl Fn(SingleEmitter<T>) + Send + Sync + 'static) -> Self {
        Self {
            on_subscribe: Arc::new(on_subscribe),
        }
    }

    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::create(move |emitter| emitter.on_success(value.clone()))
    }

    pub fn error(status: Status) -> Self {
        Self::create(move |emitter| emitter.on_error(status.clone()))
    }

    /// Resolve with the output of `future`, polled on the current tokio runtime.
    ///
    /// The future runs once; a second subscriber fails with [`BridgeError::AlreadySubscribed`].
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Status>> + Send + 'static,
    {
        let slot = Mutex::new(Some(future));
        Self::create(move |emitter| {
            let Some(future) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                emitter.on_error(BridgeError::AlreadySubscribed.into());
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                emitter.on_error(BridgeError::NoRuntime.into());
                return;
            };
            runtime.spawn(async move {
                match future.await {
                    Ok(value) => emitter.on_success(value),
                    Err(status) => emitter.on_error(status),
                }
            });
        })
    }

    /// Run the computation for `observer`. A panic inside the computation fails the observer
    /// instead of unwinding into the caller.
    pub fn subscribe(&self, observer: Arc<dyn SingleObserver<T>>) {
        let emitter = SingleEmitter::new(observer);
        let guarded = emitter.clone();
        if let Err(status) = catch_setup(|| {
            (self.on_subscribe)(guarded);
            Ok(())
        }) {
            emitter.on_error(status);
        }
    }

    pub fn subscribe_with(
        &self,
        on_success: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(Status) + Send + Sync + 'static,
    ) {
        self.subscribe(Arc::new(LambdaObserver {
            on_success,
            on_error,
        }));
    }

    pub fn map<U, F>(self, f: F) -> Single<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Single::create(move |emitter: SingleEmitter<U>| {
            let f = Arc::clone(&f);
            let failed = emitter.clone();
            self.subscribe_with(
                move |value| emitter.on_success(f(value)),
                move |status| failed.on_error(status),
            );
        })
    }

    /// Subscribe now and wait for the outcome.
    pub fn into_future(self) -> impl Future<Output = Result<T, Status>> + Send {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_error_tx = Arc::clone(&tx);
        self.subscribe_with(
            move |value| send_once(&tx, Ok(value)),
            move |status| send_once(&on_error_tx, Err(status)),
        );
        async move {
            rx.await
                .unwrap_or_else(|_| Err(Status::cancelled("single dropped without a signal")))
        }
    }
}

type ResultSender<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, Status>>>>>;

fn send_once<T>(tx: &ResultSender<T>, result: Result<T, Status>) {
    if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = tx.send(result);
    }
}

struct LambdaObserver<S, E> {
    on_success: S,
    on_error: E,
}

impl<T, S, E> SingleObserver<T> for LambdaObserver<S, E>
where
    S: Fn(T) + Send + Sync,
    E: Fn(Status) + Send + Sync,
{
    fn on_success(&self, value: T) {
        (self.on_success)(value)
    }

    fn on_error(&self, status: Status) {
        (self.on_error)(status)
    }
}
