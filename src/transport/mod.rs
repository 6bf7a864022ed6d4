//! The credit-based, callback-driven interface of the RPC transport.
//!
//! The bridge does not implement a transport. It consumes these traits, which mirror what a
//! streaming RPC stack exposes for one call:
//!
//! - [`StreamObserver`] receives messages and the terminal status.
//! - [`CallControl`] grants inbound credit and cancels the call. It carries no message type so
//!   that an inbound adapter can hold the control handle of a call whose outbound side carries a
//!   different type.
//! - [`CallStreamObserver`] is the outbound half of a call: a [`StreamObserver`] that can also
//!   report readiness and notify when buffered output drains.
//! - [`ClientResponseObserver`] is the client's response observer, which receives the request
//!   stream in [`before_start`](ClientResponseObserver::before_start), before the call starts.
//!
//! Transport callbacks for a single call are assumed to be sequential. They may come from any
//! thread.

mod cancellable;
mod lambda;

use std::sync::Arc;

use tonic::Status;

pub use cancellable::CancellableStreamObserver;
pub use lambda::LambdaStreamObserver;

/// Invoked by the transport whenever [`CallStreamObserver::is_ready`] flips back to `true`.
pub type OnReadyHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked by the transport when the call is cancelled, by the peer or locally.
pub type OnCancelHandler = Arc<dyn Fn() + Send + Sync>;

/// Receives the messages and the terminal status of one direction of a call.
pub trait StreamObserver<T>: Send + Sync {
    fn on_next(&self, value: T);
    fn on_error(&self, status: Status);
    fn on_completed(&self);
}

impl<T, O: StreamObserver<T> + ?Sized> StreamObserver<T> for Arc<O> {
    fn on_next(&self, value: T) {
        (**self).on_next(value)
    }

    fn on_error(&self, status: Status) {
        (**self).on_error(status)
    }

    fn on_completed(&self) {
        (**self).on_completed()
    }
}

/// Flow-control and lifecycle operations of a call.
pub trait CallControl: Send + Sync {
    /// Stop the transport from requesting inbound messages on its own. After this, inbound
    /// messages only arrive in response to [`request`](CallControl::request).
    fn disable_auto_inbound_flow_control(&self);

    /// Grant credit for `count` more inbound messages.
    fn request(&self, count: usize);

    /// Terminate the call.
    fn cancel(&self, reason: Status);
}

impl<C: CallControl + ?Sized> CallControl for Arc<C> {
    fn disable_auto_inbound_flow_control(&self) {
        (**self).disable_auto_inbound_flow_control()
    }

    fn request(&self, count: usize) {
        (**self).request(count)
    }

    fn cancel(&self, reason: Status) {
        (**self).cancel(reason)
    }
}

/// The outbound half of a call: writes messages and reports whether the transport can take more.
pub trait CallStreamObserver<T>: StreamObserver<T> + CallControl {
    /// Whether a message written now would be sent without excessive buffering.
    fn is_ready(&self) -> bool;

    /// Register the callback fired when the transport becomes ready again.
    fn set_on_ready_handler(&self, handler: OnReadyHandler);

    /// Register the callback fired when the call is cancelled. Transports without a cancel
    /// notification may leave this as a no-op.
    fn set_on_cancel_handler(&self, handler: OnCancelHandler) {
        let _ = handler;
    }
}

/// A client's response observer, handed the request stream before the call starts.
pub trait ClientResponseObserver<Req, Resp>: StreamObserver<Resp> {
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>);
}

impl<Req, Resp, O> ClientResponseObserver<Req, Resp> for Arc<O>
where
    O: ClientResponseObserver<Req, Resp> + ?Sized,
{
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        (**self).before_start(request_stream)
    }
}

/// Erase the message type of a call handle, keeping only its control operations.
pub(crate) fn control_of<T: 'static>(call: Arc<dyn CallStreamObserver<T>>) -> Arc<dyn CallControl> {
    Arc::new(call)
}
