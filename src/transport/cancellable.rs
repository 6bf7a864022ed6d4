use std::sync::Arc;

use tonic::Status;
use tracing::debug;

use crate::error::is_cancelled;
use crate::transport::{CallStreamObserver, ClientResponseObserver, StreamObserver};

/// Wraps a response observer and runs a callback when the call ends because it was cancelled.
///
/// A `CANCELLED` status still reaches the delegate as an error; the callback runs first so
/// callers can treat deliberate cancellation as a lifecycle event. Any other failure only
/// reaches the delegate.
pub struct CancellableStreamObserver<D> {
    delegate: D,
    on_cancelled: Box<dyn Fn() + Send + Sync>,
}

impl<D> CancellableStreamObserver<D> {
    pub fn new(delegate: D, on_cancelled: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            delegate,
            on_cancelled: Box::new(on_cancelled),
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }
}

impl<T, D: StreamObserver<T>> StreamObserver<T> for CancellableStreamObserver<D> {
    fn on_next(&self, value: T) {
        self.delegate.on_next(value);
    }

    fn on_error(&self, status: Status) {
        if is_cancelled(&status) {
            debug!(status = %status, "Call cancelled");
            (self.on_cancelled)();
        }
        self.delegate.on_error(status);
    }

    fn on_completed(&self) {
        self.delegate.on_completed();
    }
}

impl<Req, Resp, D> ClientResponseObserver<Req, Resp> for CancellableStreamObserver<D>
where
    D: ClientResponseObserver<Req, Resp>,
{
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        self.delegate.before_start(request_stream);
    }
}
