//! Demand-based reactive stream contract.
//!
//! A [`Publisher`] hands each [`Subscriber`] a [`Subscription`] through which the subscriber
//! pulls elements with [`request`](Subscription::request). A publisher never signals more
//! `on_next` calls than the subscriber has requested, and each subscriber sees at most one
//! terminal signal (`on_complete` or `on_error`).
//!
//! All three roles take `&self` and are shared as `Arc`s: signals arrive on whichever thread the
//! transport or the application uses, and a subscriber may call back into its subscription from
//! inside `on_next`. Implementations therefore keep their state in atomics or short-lived locks
//! and never hold a lock while calling into another role.
//!
//! Errors travel as [`tonic::Status`], the same type the transport reports, so a transport
//! failure and a pipeline failure look identical to a consumer.

mod demand;
mod flowable;
mod lifecycle;
mod single;
mod stream;

use std::sync::Arc;

use tonic::Status;

pub use demand::{DemandCounter, UNBOUNDED};
pub use flowable::Flowable;
pub use lifecycle::{AtomicLifecycle, Lifecycle};
pub use single::{Single, SingleEmitter, SingleObserver};
pub use stream::FlowableStream;

/// The demand channel between one publisher and one subscriber.
pub trait Subscription: Send + Sync {
    /// Ask for up to `n` more elements. `n == 0` is a contract violation that publishers answer
    /// with an `on_error`.
    fn request(&self, n: u64);

    /// Stop the flow. After this returns the publisher eventually stops signalling.
    fn cancel(&self);
}

/// Receives the signals of one subscription.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, status: Status);
    fn on_complete(&self);
}

/// A source of elements that honours subscriber demand.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// The last signal a consumer observes.
#[derive(Debug, Clone)]
pub enum Terminal {
    Completed,
    Failed(Status),
    Cancelled,
}

impl Terminal {
    /// Deliver this terminal to `subscriber`. `Cancelled` has no downstream signal of its own.
    pub(crate) fn deliver<T>(self, subscriber: &dyn Subscriber<T>) {
        match self {
            Terminal::Completed => subscriber.on_complete(),
            Terminal::Failed(status) => subscriber.on_error(status),
            Terminal::Cancelled => {}
        }
    }
}

/// A subscription that ignores every call, handed out when a subscriber must be rejected.
pub(crate) struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Reject `subscriber` immediately with `status`, following the rule that `on_subscribe` always
/// precedes any other signal.
pub(crate) fn reject<T>(subscriber: &dyn Subscriber<T>, status: Status) {
    subscriber.on_subscribe(Arc::new(EmptySubscription));
    subscriber.on_error(status);
}
