use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::Status;

use crate::error::BridgeError;
use crate::reactive::SingleEmitter;
use crate::transport::StreamObserver;

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(Status) + Send + Sync>;
type CompletedFn = Box<dyn Fn() + Send + Sync>;

/// A [`StreamObserver`] assembled from closures.
pub struct LambdaStreamObserver<T> {
    on_next: NextFn<T>,
    on_error: ErrorFn,
    on_completed: CompletedFn,
}

impl<T: Send + 'static> LambdaStreamObserver<T> {
    pub fn new(
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(Status) + Send + Sync + 'static,
        on_completed: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
            on_completed: Box::new(on_completed),
        }
    }

    /// Feed a unary response into `emitter`: the first message succeeds it, a failure fails it,
    /// and a completion that carried no message fails it with [`BridgeError::NoResponse`].
    pub fn from_single_emitter(emitter: SingleEmitter<T>) -> Self {
        let received = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&received);
        let on_next_emitter = emitter.clone();
        let on_error_emitter = emitter.clone();

        Self::new(
            move |value| {
                seen.store(true, Ordering::Release);
                on_next_emitter.on_success(value);
            },
            move |status| on_error_emitter.on_error(status),
            move || {
                if !received.load(Ordering::Acquire) {
                    emitter.on_error(BridgeError::NoResponse.into());
                }
            },
        )
    }
}

impl<T: Send + 'static> StreamObserver<T> for LambdaStreamObserver<T> {
    fn on_next(&self, value: T) {
        (self.on_next)(value)
    }

    fn on_error(&self, status: Status) {
        (self.on_error)(status)
    }

    fn on_completed(&self) {
        (self.on_completed)()
    }
}
